//! Framed messages with out-of-band descriptor passing over a local stream
//! socket.
//!
//! Every message is a header (magic, version, body length) followed by a
//! serialized body. Descriptors ride in the ancillary data of the same
//! `sendmsg` that carries the first bytes of the frame.

use std::{
    mem::size_of,
    os::{
        fd::RawFd,
        unix::{
            net::UnixStream,
            prelude::{FromRawFd, OwnedFd},
        },
    },
};

use bytes::{buf::Limit, Buf, BufMut, BytesMut};
use thiserror::Error;
use uds::UnixStreamExt;

use crate::ser;

pub const FRAME_MAGIC: [u8; 4] = *b"WSHD";
pub const FRAME_VERSION: u16 = 1;

/// Upper bound on a frame body; a request is a handful of bounded paths and
/// an environment overlay, so anything larger is a broken or hostile peer.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

const HEADER_SIZE: usize = FRAME_MAGIC.len() + size_of::<u16>() + size_of::<u32>();
const READ_BUFFER_SIZE: usize = 8192;
const FD_BUFFER_SIZE: usize = 32;

pub trait LimitExt {
    fn reserve_and_limit(&mut self, len: usize) -> Limit<&mut Self>;
}

impl LimitExt for BytesMut {
    fn reserve_and_limit(&mut self, len: usize) -> Limit<&mut Self> {
        self.reserve(len);
        <&mut BytesMut>::limit(self, len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u16),
    #[error("frame body of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum SocketMessageError {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Serialize(#[from] ser::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub trait DomainSocket {
    fn send_all(&self, data: &mut impl Buf, fds: &[RawFd]) -> Result<(), std::io::Error>;

    fn recv_exact(
        &self,
        data: &mut impl BufMut,
        fds: &mut impl Extend<OwnedFd>,
    ) -> Result<(), std::io::Error>;

    /// Like [`DomainSocket::recv_exact`], but reports a peer that closed the
    /// connection before sending anything as `Ok(false)`.
    fn recv_exact_or_eof(
        &self,
        data: &mut impl BufMut,
        fds: &mut impl Extend<OwnedFd>,
    ) -> Result<bool, std::io::Error>;

    fn send_message<T: ser::Serialize>(
        &self,
        message: &T,
        fds: &[RawFd],
    ) -> Result<(), SocketMessageError> {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        buf.put_slice(&FRAME_MAGIC);
        buf.put_u16_le(FRAME_VERSION);
        buf.put_u32_le(0);
        ser::serialize(message, &mut buf)?;

        let len = buf.len() - HEADER_SIZE;
        if len > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                len,
                max: MAX_FRAME_BYTES,
            }
            .into());
        }
        let at = HEADER_SIZE - size_of::<u32>();
        buf[at..HEADER_SIZE].copy_from_slice(&(len as u32).to_le_bytes());

        self.send_all(&mut buf, fds)?;
        Ok(())
    }

    /// Receives one framed message, or `None` when the peer closed the
    /// connection without sending a byte.
    fn recv_message<T: ser::Deserialize>(
        &self,
        fds: &mut impl Extend<OwnedFd>,
    ) -> Result<Option<T>, SocketMessageError> {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        if !self.recv_exact_or_eof(&mut buf.reserve_and_limit(HEADER_SIZE), fds)? {
            return Ok(None);
        }

        let magic: [u8; 4] = buf[..FRAME_MAGIC.len()].try_into().unwrap();
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic).into());
        }
        let at = FRAME_MAGIC.len();
        let version = u16::from_le_bytes(buf[at..at + 2].try_into().unwrap());
        if version != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(version).into());
        }
        let at = at + 2;
        let len = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                len,
                max: MAX_FRAME_BYTES,
            }
            .into());
        }

        buf.clear();
        self.recv_exact(&mut buf.reserve_and_limit(len), fds)?;

        let result = ser::deserialize(&mut buf)?;
        Ok(Some(result))
    }
}

impl DomainSocket for UnixStream {
    fn send_all(&self, data: &mut impl Buf, mut fds: &[RawFd]) -> Result<(), std::io::Error> {
        while data.has_remaining() {
            let remaining = data.chunk();
            let size = self.send_fds(remaining, fds)?;
            data.advance(size);
            fds = &[];
        }
        Ok(())
    }

    fn recv_exact(
        &self,
        data: &mut impl BufMut,
        fds: &mut impl Extend<OwnedFd>,
    ) -> Result<(), std::io::Error> {
        if self.recv_exact_or_eof(data, fds)? {
            Ok(())
        } else {
            Err(std::io::ErrorKind::UnexpectedEof.into())
        }
    }

    fn recv_exact_or_eof(
        &self,
        data: &mut impl BufMut,
        fds: &mut impl Extend<OwnedFd>,
    ) -> Result<bool, std::io::Error> {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let mut fd_buffer = [0 as RawFd; FD_BUFFER_SIZE];
        let mut received = 0usize;

        while data.has_remaining_mut() {
            let to_read = buffer.len().min(data.remaining_mut());
            let (buf_size, fds_size) = self.recv_fds(&mut buffer[..to_read], &mut fd_buffer)?;
            fds.extend(
                fd_buffer[..fds_size]
                    .iter()
                    .map(|v| unsafe { OwnedFd::from_raw_fd(*v) }),
            );
            if buf_size == 0 {
                if received == 0 && fds_size == 0 {
                    return Ok(false);
                }
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            received += buf_size;
            data.put(&buffer[..buf_size]);
        }
        Ok(true)
    }
}
