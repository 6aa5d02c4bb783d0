use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use nix::{errno::Errno, libc};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("failed to change close-on-exec on fd {fd}: {source}")]
pub struct CloexecError {
    fd: i32,
    #[source]
    source: Errno,
}

#[inline(always)]
pub(crate) fn make_owned_fd<F: IntoRawFd, E>(
    f: impl FnOnce() -> Result<F, E>,
) -> Result<OwnedFd, E> {
    f().map(|fd| unsafe { OwnedFd::from_raw_fd(fd.into_raw_fd()) })
}

/// Sets or clears `FD_CLOEXEC` on a descriptor.
///
/// Every descriptor the daemon keeps for itself is sealed with this before a
/// spawned child can reach an exec; the handful that must survive the
/// daemon's own re-exec are explicitly unsealed.
pub fn set_cloexec(fd: impl AsRawFd, on: bool) -> Result<(), CloexecError> {
    let fd = fd.as_raw_fd();
    let err = |source| CloexecError { fd, source };

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(err(Errno::last()));
    }

    let wanted = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if wanted != flags && unsafe { libc::fcntl(fd, libc::F_SETFD, wanted) } == -1 {
        return Err(err(Errno::last()));
    }

    Ok(())
}
