use std::{
    fs::File,
    io::{Read as _, Write as _},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
};

use bytes::BytesMut;
use nix::errno::Errno;
use thiserror::Error;
use wshd_private::ser;

/// Descriptor number the staged state is parked on across exec.
///
/// The continuation is started with a single sentinel flag and no other
/// channel, so the number has to be agreed on ahead of time. High enough to
/// clear stdio and every descriptor the bootstrap opens.
pub const HANDOFF_FD: RawFd = 103;

/// The staged record must fit the pipe in one write, or the writer would
/// block with nobody ever reading.
const MAX_STAGED_BYTES: usize = 60 * 1024;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("failed to create the handoff pipe: {0}")]
    Create(#[source] Errno),
    #[error("failed to park the handoff pipe on fd {HANDOFF_FD}: {0}")]
    Park(#[source] Errno),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] ser::Error),
    #[error("failed to deserialize state: {0}")]
    Deserialize(#[source] ser::Error),
    #[error("staged state is {len} bytes, limit is {MAX_STAGED_BYTES}")]
    TooLarge { len: usize },
}

/// Parks a serialized copy of `state` where [`recover`] will find it after
/// the process image is replaced.
///
/// The transport is a pipe rather than keyed shared memory: nothing global
/// is allocated, the read end dies with the process on a failed exec, and
/// only the exec'ed continuation can ever observe the state.
#[tracing::instrument(skip_all, err(level = "debug"))]
pub fn stage<T: ser::Serialize>(state: &T) -> Result<(), HandoffError> {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&0u32.to_le_bytes());
    ser::serialize(state, &mut buf).map_err(HandoffError::Serialize)?;

    let len = buf.len() - 4;
    if buf.len() > MAX_STAGED_BYTES {
        return Err(HandoffError::TooLarge { len });
    }
    buf[..4].copy_from_slice(&(len as u32).to_le_bytes());

    let (rx, tx) = nix::unistd::pipe().map_err(HandoffError::Create)?;
    let mut writer = File::from(tx);
    writer.write_all(&buf)?;
    drop(writer);

    let raw = rx.as_raw_fd();
    if raw == HANDOFF_FD {
        // Already parked; leak the handle so drop does not close it.
        let _ = rx.into_raw_fd();
    } else {
        nix::unistd::dup2(raw, HANDOFF_FD).map_err(HandoffError::Park)?;
        drop(rx);
    }

    tracing::trace!(len, "staged state for the continuation");
    Ok(())
}

/// Reads the staged state back and destroys the transport.
///
/// # Safety
///
/// Must be called at most once, in a process whose fd [`HANDOFF_FD`] was
/// populated by [`stage`] before exec; it takes ownership of that
/// descriptor.
#[tracing::instrument(err(level = "debug"))]
pub unsafe fn recover<T: ser::Deserialize>() -> Result<T, HandoffError> {
    let mut reader = unsafe { File::from_raw_fd(HANDOFF_FD) };

    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_STAGED_BYTES {
        return Err(HandoffError::TooLarge { len });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;

    let state = ser::deserialize(&mut &buf[..]).map_err(HandoffError::Deserialize)?;
    tracing::trace!(len, "recovered state from the handoff");
    Ok(state)
}
