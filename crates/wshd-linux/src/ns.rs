use std::{
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::Path,
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    sched::CloneFlags,
    sys::stat::Mode,
};
use thiserror::Error;

use crate::{fd::make_owned_fd, Syscall};

const MOUNT_NS_PATH: &str = "/proc/self/ns/mnt";

#[derive(Debug, Clone, Error)]
pub enum NsError {
    #[error("failed to unshare the mount namespace: {0}")]
    Unshare(#[source] Errno),
    #[error("failed to open {MOUNT_NS_PATH}: {0}")]
    Open(#[source] Errno),
    #[error("failed to enter mount namespace: {0}")]
    Enter(#[source] Errno),
}

/// Syscalls for moving between mount namespaces.
pub trait NsSyscall {
    /// Detaches the current process into a copy of its mount namespace.
    fn unshare_mount_ns() -> Result<(), NsError>;

    /// A close-on-exec handle to the current mount namespace.
    fn current_mount_ns() -> Result<OwnedFd, NsError>;

    /// Like [`NsSyscall::current_mount_ns`], but the handle survives exec.
    ///
    /// Used for the namespace snapshot that has to ride through the daemon's
    /// own image replacement.
    fn current_mount_ns_inheritable() -> Result<OwnedFd, NsError>;

    fn enter_mount_ns(ns: BorrowedFd) -> Result<(), NsError>;
}

impl NsSyscall for Syscall {
    #[tracing::instrument(err(level = "debug"))]
    fn unshare_mount_ns() -> Result<(), NsError> {
        nix::sched::unshare(CloneFlags::CLONE_NEWNS)
            .inspect_err(|error| tracing::debug!(?error, "failed to unshare"))
            .inspect(|_| tracing::trace!("unshared the mount namespace"))
            .map_err(NsError::Unshare)
    }

    fn current_mount_ns() -> Result<OwnedFd, NsError> {
        open_mount_ns(OFlag::O_RDONLY | OFlag::O_CLOEXEC)
    }

    fn current_mount_ns_inheritable() -> Result<OwnedFd, NsError> {
        open_mount_ns(OFlag::O_RDONLY)
    }

    #[tracing::instrument(skip_all, err(level = "debug"))]
    fn enter_mount_ns(ns: BorrowedFd) -> Result<(), NsError> {
        nix::sched::setns(ns, CloneFlags::CLONE_NEWNS)
            .inspect_err(|error| tracing::debug!(?error, "failed to setns"))
            .inspect(|_| tracing::trace!("entered mount namespace"))
            .map_err(NsError::Enter)
    }
}

fn open_mount_ns(flags: OFlag) -> Result<OwnedFd, NsError> {
    make_owned_fd(|| nix::fcntl::open(Path::new(MOUNT_NS_PATH), flags, Mode::empty()))
        .map_err(NsError::Open)
}

/// Scoped excursion into another mount namespace.
///
/// Construction captures the current namespace and enters the target; drop
/// returns to the captured one. A failed return would leave the process
/// mutating the wrong mount table, so it aborts.
pub struct MountNsGuard {
    restore_to: OwnedFd,
}

impl MountNsGuard {
    pub fn enter(target: BorrowedFd) -> Result<Self, NsError> {
        let restore_to = Syscall::current_mount_ns()?;
        Syscall::enter_mount_ns(target)?;
        Ok(Self { restore_to })
    }
}

impl Drop for MountNsGuard {
    fn drop(&mut self) {
        if let Err(error) = Syscall::enter_mount_ns(self.restore_to.as_fd()) {
            tracing::error!(?error, "failed to return to the original mount namespace");
            std::process::abort();
        }
    }
}
