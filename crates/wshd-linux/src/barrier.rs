use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("failed to open barrier: {0}")]
    Open(#[source] Errno),
    #[error("failed to signal barrier: {0}")]
    Signal(#[source] Errno),
    #[error("failed to wait on barrier: {0}")]
    Wait(#[source] Errno),
    #[error("barrier peer went away before signalling")]
    PeerGone,
}

/// One-shot cross-process rendezvous over a pipe.
///
/// After fork or clone both processes hold the whole pair; each side splits
/// it and drops the half it does not use, so a peer that dies without
/// signalling is observed as EOF instead of a hang.
#[derive(Debug)]
pub struct Barrier {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl Barrier {
    pub fn open() -> Result<Self, BarrierError> {
        let (rx, tx) = nix::unistd::pipe().map_err(BarrierError::Open)?;
        Ok(Self { rx, tx })
    }

    pub fn signal(&self) -> Result<(), BarrierError> {
        signal_fd(&self.tx)
    }

    pub fn wait(&self) -> Result<(), BarrierError> {
        wait_fd(self.rx.as_raw_fd())
    }

    /// Splits into the single-role halves.
    pub fn split(self) -> (WaitHalf, SignalHalf) {
        (WaitHalf(self.rx), SignalHalf(self.tx))
    }

    /// Splits into the owned (read, write) ends.
    pub fn into_parts(self) -> (OwnedFd, OwnedFd) {
        (self.rx, self.tx)
    }
}

/// The waiting side of a barrier.
#[derive(Debug)]
pub struct WaitHalf(OwnedFd);

impl WaitHalf {
    #[tracing::instrument(skip_all, err(level = "debug"))]
    pub fn wait(&self) -> Result<(), BarrierError> {
        wait_fd(self.0.as_raw_fd())
    }

    /// Reclaims a half whose descriptor number travelled through the
    /// exec-boundary handoff.
    ///
    /// # Safety
    ///
    /// `fd` must be the live read end of a barrier pipe owned by nothing
    /// else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self(OwnedFd::from_raw_fd(fd))
    }
}

impl AsRawFd for WaitHalf {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// The signalling side of a barrier.
#[derive(Debug)]
pub struct SignalHalf(OwnedFd);

impl SignalHalf {
    #[tracing::instrument(skip_all, err(level = "debug"))]
    pub fn signal(&self) -> Result<(), BarrierError> {
        signal_fd(&self.0)
    }

    /// # Safety
    ///
    /// `fd` must be the live write end of a barrier pipe owned by nothing
    /// else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self(OwnedFd::from_raw_fd(fd))
    }
}

impl AsRawFd for SignalHalf {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for SignalHalf {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

fn signal_fd(fd: &impl std::os::fd::AsFd) -> Result<(), BarrierError> {
    loop {
        match nix::unistd::write(fd, &[0u8]) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(BarrierError::Signal(source)),
        }
    }
}

fn wait_fd(fd: RawFd) -> Result<(), BarrierError> {
    let mut buf = [0u8; 1];
    loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => return Err(BarrierError::PeerGone),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(BarrierError::Wait(source)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signal_then_wait() {
        let barrier = Barrier::open().unwrap();
        barrier.signal().unwrap();
        barrier.wait().unwrap();
    }

    #[test]
    fn split_halves_rendezvous() {
        let (wait, signal) = Barrier::open().unwrap().split();
        signal.signal().unwrap();
        wait.wait().unwrap();
    }

    #[test]
    fn dead_peer_is_eof() {
        // Signal half dropped before signalling: the waiter must observe
        // PeerGone, not hang.
        let (wait, signal) = Barrier::open().unwrap().split();
        drop(signal);
        assert!(matches!(wait.wait(), Err(BarrierError::PeerGone)));
    }
}
