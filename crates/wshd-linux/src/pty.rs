use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::{errno::Errno, libc};
use thiserror::Error;

use crate::{
    fd::{set_cloexec, CloexecError},
    Syscall,
};

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open a pseudo-terminal pair: {0}")]
    Open(#[source] Errno),
    #[error("failed to make the terminal controlling: {0}")]
    SetControlling(#[source] Errno),
    #[error(transparent)]
    Seal(#[from] CloexecError),
}

/// A master/slave pseudo-terminal pair, both ends close-on-exec.
#[derive(Debug)]
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

pub trait PtySyscall {
    fn openpty() -> Result<PtyPair, PtyError>;

    /// Makes `fd` the controlling terminal of the current session.
    ///
    /// Only meaningful after `setsid`; the caller must already be a session
    /// leader.
    fn make_controlling_tty(fd: impl AsRawFd) -> Result<(), PtyError>;

    fn is_tty(fd: impl AsRawFd) -> bool;
}

impl PtySyscall for Syscall {
    #[tracing::instrument(err(level = "debug"))]
    fn openpty() -> Result<PtyPair, PtyError> {
        let pty = nix::pty::openpty(None, None)
            .inspect_err(|error| tracing::debug!(?error, "failed to openpty"))
            .map_err(PtyError::Open)?;

        set_cloexec(pty.master.as_fd(), true)?;
        set_cloexec(pty.slave.as_fd(), true)?;

        Ok(PtyPair {
            master: pty.master,
            slave: pty.slave,
        })
    }

    fn make_controlling_tty(fd: impl AsRawFd) -> Result<(), PtyError> {
        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSCTTY, 1) } == -1 {
            return Err(PtyError::SetControlling(Errno::last()));
        }
        Ok(())
    }

    fn is_tty(fd: impl AsRawFd) -> bool {
        nix::unistd::isatty(fd.as_raw_fd()).unwrap_or(false)
    }
}
