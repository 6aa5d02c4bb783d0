use nix::{
    errno::Errno,
    mount::{MntFlags, MsFlags},
};
use procfs::process::MountOptFields;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::{Syscall, NO_PATH};

#[derive(Debug, Clone, Error)]
#[error("failed to bind mount {path:?}: {source}")]
pub struct BindError {
    path: PathBuf,
    #[source]
    source: Errno,
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct BindFlags: u64 {
        /// Create a recursive bind mount.
        const RECURSIVE = MsFlags::MS_REC.bits();
    }
}

#[derive(Debug, Clone, Error)]
#[error("failed to change propagation of {path:?}: {source}")]
pub struct PropagationError {
    path: PathBuf,
    #[source]
    source: Errno,
}

#[derive(Debug, Clone, Error)]
#[error("failed to unmount {path:?}: {source}")]
pub struct UnmountError {
    path: PathBuf,
    #[source]
    source: Errno,
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct UnmountFlags: u64 {
        /// Lazy unmount: detach now, release once the mount stops being busy.
        const DETACH = MntFlags::MNT_DETACH.bits() as u64;
    }
}

#[derive(Debug, Clone, Error)]
#[error("failed to pivot to new root at {path:?}: {source}")]
pub struct PivotError {
    path: PathBuf,
    #[source]
    source: Errno,
}

pub trait FsSyscall {
    fn bind(
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
        flags: BindFlags,
    ) -> Result<(), BindError>;

    /// Marks an existing mount point shared so later mounts beneath it
    /// propagate to peer namespaces.
    fn make_shared(target: impl AsRef<Path>) -> Result<(), PropagationError>;

    /// Recursively converts a mount tree to slave propagation: it keeps
    /// receiving mounts from its former peers but no longer sends any back,
    /// and stops being `MS_SHARED`, which `pivot_root` refuses.
    fn make_rslave(target: impl AsRef<Path>) -> Result<(), PropagationError>;

    fn unmount(path: impl AsRef<Path>, flags: UnmountFlags) -> Result<(), UnmountError>;

    /// Makes `new_root` the root of the current mount namespace, parking the
    /// old root on `put_old` (a directory beneath `new_root`).
    ///
    /// The caller must already have bind-mounted `new_root` onto itself and
    /// changed into it; the old root stays reachable at `put_old` until it
    /// is detached.
    fn pivot(new_root: impl AsRef<Path>, put_old: impl AsRef<Path>) -> Result<(), PivotError>;
}

impl FsSyscall for Syscall {
    #[tracing::instrument(skip_all, fields(
        source = ?source.as_ref(),
        target = ?target.as_ref(),
        ?flags,
    ), err(level = "debug"))]
    fn bind(
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
        flags: BindFlags,
    ) -> Result<(), BindError> {
        let source = source.as_ref();
        let target = target.as_ref();
        let mut mount_flags = MsFlags::MS_BIND;

        if flags.contains(BindFlags::RECURSIVE) {
            mount_flags |= MsFlags::MS_REC;
        }

        nix::mount::mount(Some(source), target, NO_PATH, mount_flags, NO_PATH)
            .inspect_err(|error| tracing::debug!(?error, "failed to bind mount"))
            .inspect(|_| tracing::trace!("created bind mount"))
            .map_err(|source| BindError {
                path: target.to_path_buf(),
                source,
            })
    }

    #[tracing::instrument(skip_all, fields(target = ?target.as_ref()), err(level = "debug"))]
    fn make_shared(target: impl AsRef<Path>) -> Result<(), PropagationError> {
        let target = target.as_ref();

        nix::mount::mount(NO_PATH, target, NO_PATH, MsFlags::MS_SHARED, NO_PATH)
            .inspect_err(|error| tracing::debug!(?error, "failed to make mount shared"))
            .inspect(|_| tracing::trace!("made mount shared"))
            .map_err(|source| PropagationError {
                path: target.to_path_buf(),
                source,
            })
    }

    #[tracing::instrument(skip_all, fields(target = ?target.as_ref()), err(level = "debug"))]
    fn make_rslave(target: impl AsRef<Path>) -> Result<(), PropagationError> {
        let target = target.as_ref();

        nix::mount::mount(
            NO_PATH,
            target,
            NO_PATH,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            NO_PATH,
        )
        .inspect_err(|error| tracing::debug!(?error, "failed to make mount tree slave"))
        .inspect(|_| tracing::trace!("made mount tree slave"))
        .map_err(|source| PropagationError {
            path: target.to_path_buf(),
            source,
        })
    }

    #[tracing::instrument(skip_all, fields(
        path = ?path.as_ref(),
        ?flags,
    ), err(level = "debug"))]
    fn unmount(path: impl AsRef<Path>, flags: UnmountFlags) -> Result<(), UnmountError> {
        let path = path.as_ref();
        let flags = MntFlags::from_bits_truncate(flags.bits() as i32);

        nix::mount::umount2(path, flags)
            .inspect_err(|error| tracing::debug!(?error, "failed to unmount"))
            .inspect(|_| tracing::trace!("unmounted"))
            .map_err(|source| UnmountError {
                path: path.to_path_buf(),
                source,
            })
    }

    #[tracing::instrument(skip_all, fields(
        new_root = ?new_root.as_ref(),
        put_old = ?put_old.as_ref(),
    ), err(level = "debug"))]
    fn pivot(new_root: impl AsRef<Path>, put_old: impl AsRef<Path>) -> Result<(), PivotError> {
        let new_root = new_root.as_ref();
        let put_old = put_old.as_ref();

        nix::unistd::pivot_root(new_root, put_old)
            .inspect_err(|error| tracing::debug!(?error, "failed to pivot root"))
            .inspect(|_| tracing::trace!("pivoted root"))
            .map_err(|source| PivotError {
                path: new_root.to_path_buf(),
                source,
            })
    }
}

/// Whether the mount at `path` is in a shared peer group.
///
/// Errors collapse to `None`: this only feeds diagnostics, a superfluous
/// warning is acceptable.
pub fn is_shared_mount(path: &Path) -> Option<bool> {
    let myself = procfs::process::Process::myself().ok()?;
    let mountinfo = myself.mountinfo().ok()?;
    let mount = mountinfo.into_iter().find(|mi| path == mi.mount_point)?;

    let has_shared = mount
        .opt_fields
        .iter()
        .any(|field| matches!(field, MountOptFields::Shared(_)));

    Some(has_shared)
}

// Mount behaviour is covered by integration tests, which have to clone into
// private namespaces first:
//
// ../tests/fs_bind.rs
// ../tests/fs_pivot.rs
