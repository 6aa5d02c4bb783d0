use std::{
    io::{Read as _, Write as _},
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::net::UnixStream,
    },
};

use anyhow::Context as _;
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use wshd_private::io::{
    DomainSocket as _, FrameError, SocketMessageError, FRAME_MAGIC, FRAME_VERSION, MAX_FRAME_BYTES,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
    payload: String,
}

type Result = anyhow::Result<()>;

#[test]
fn message_round_trip_with_fds() -> Result {
    let (client, server) = UnixStream::pair()?;
    let (pipe_rx, pipe_tx) = nix::unistd::pipe()?;

    let sent = Ping {
        seq: 7,
        payload: "hello".into(),
    };
    client.send_message(&sent, &[pipe_rx.as_raw_fd()])?;
    drop(pipe_rx);

    let mut fds: Vec<OwnedFd> = Vec::new();
    let received: Ping = server
        .recv_message(&mut fds)?
        .context("peer closed instead of sending")?;

    assert_eq!(received, sent);
    assert_eq!(fds.len(), 1);

    // The passed descriptor is live: bytes written to the pipe show up on it.
    nix::unistd::write(&pipe_tx, b"x")?;
    drop(pipe_tx);
    let mut via_passed = std::fs::File::from(fds.pop().unwrap());
    let mut buf = Vec::new();
    via_passed.read_to_end(&mut buf)?;
    assert_eq!(buf, b"x");

    Ok(())
}

#[test]
fn peer_closing_without_sending_is_none() -> Result {
    let (client, server) = UnixStream::pair()?;
    drop(client);

    let mut fds: Vec<OwnedFd> = Vec::new();
    let received: Option<Ping> = server.recv_message(&mut fds)?;
    assert_eq!(received, None);
    Ok(())
}

#[test]
fn eof_inside_header_is_an_error() -> Result {
    let (mut client, server) = UnixStream::pair()?;
    client.write_all(&FRAME_MAGIC[..3])?;
    drop(client);

    let mut fds: Vec<OwnedFd> = Vec::new();
    match server.recv_message::<Ping>(&mut fds) {
        Err(SocketMessageError::IO(e)) => {
            assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof)
        }
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn bad_magic_is_rejected() -> Result {
    let (mut client, server) = UnixStream::pair()?;
    client.write_all(b"NOPE")?;
    client.write_all(&FRAME_VERSION.to_le_bytes())?;
    client.write_all(&0u32.to_le_bytes())?;

    let mut fds: Vec<OwnedFd> = Vec::new();
    match server.recv_message::<Ping>(&mut fds) {
        Err(SocketMessageError::Frame(FrameError::BadMagic(m))) => assert_eq!(&m, b"NOPE"),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn unknown_version_is_rejected() -> Result {
    let (mut client, server) = UnixStream::pair()?;
    client.write_all(&FRAME_MAGIC)?;
    client.write_all(&9u16.to_le_bytes())?;
    client.write_all(&0u32.to_le_bytes())?;

    let mut fds: Vec<OwnedFd> = Vec::new();
    match server.recv_message::<Ping>(&mut fds) {
        Err(SocketMessageError::Frame(FrameError::UnsupportedVersion(v))) => assert_eq!(v, 9),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn oversized_frame_is_rejected_before_the_body() -> Result {
    let (mut client, server) = UnixStream::pair()?;
    client.write_all(&FRAME_MAGIC)?;
    client.write_all(&FRAME_VERSION.to_le_bytes())?;
    client.write_all(&((MAX_FRAME_BYTES + 1) as u32).to_le_bytes())?;
    // No body follows; the length check alone must fail the receive.

    let mut fds: Vec<OwnedFd> = Vec::new();
    match server.recv_message::<Ping>(&mut fds) {
        Err(SocketMessageError::Frame(FrameError::TooLarge { len, .. })) => {
            assert_eq!(len, MAX_FRAME_BYTES + 1)
        }
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}
