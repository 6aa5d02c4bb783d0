use std::{
    os::{fd::AsFd, unix::net::UnixStream},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use nix::{
    errno::Errno,
    sys::stat::Mode,
    unistd::{chown, mkdir, Gid, Uid},
};
use wshd_linux::{BindFlags, FsSyscall as _, MountNsGuard, Syscall};
use wshd_model::{BoundedName, BoundedPath, SpawnResponse};
use wshd_private::io::DomainSocket as _;

use crate::state::{Daemon, CONTAINER_MOUNTS_PATH};

/// Injects a host directory into the live container.
///
/// The host-side half happens inside the saved host mount namespace, under
/// the shared volumes tree; propagation carries it into this namespace,
/// where the container-side bind makes it visible at the requested
/// destination. Failures here are setup errors: the caller treats them as
/// fatal, there is no partial-success path.
pub fn handle_bind_mount(
    daemon: &Daemon,
    conn: &UnixStream,
    source: &BoundedPath,
    destination: &BoundedPath,
    name: &BoundedName,
) -> anyhow::Result<()> {
    let host_path = daemon.volumes_dir.join(name.as_str());
    let container_path = Path::new(CONTAINER_MOUNTS_PATH).join(name.as_str());
    tracing::info!(?source, ?destination, %name, "injecting bind mount");

    {
        let _host = MountNsGuard::enter(daemon.host_mount_ns.as_fd())
            .context("failed to enter the host mount namespace")?;

        // Re-binding the same name stacks a fresh mount over the previous
        // one; the container view stays correct either way.
        mkdir_unless_exists(&host_path, Mode::from_bits_truncate(0o755))
            .with_context(|| format!("failed to create {host_path:?}"))?;
        Syscall::bind(source.as_path(), &host_path, BindFlags::empty())
            .context("failed to bind the source on the host side")?;

        // Guard drops here, putting this process back into the container
        // namespace before anything else happens.
    }

    mkdir_p_as(
        destination.as_path(),
        Uid::from_raw(0),
        Gid::from_raw(0),
    )
    .with_context(|| format!("failed to create {destination:?}"))?;
    Syscall::bind(&container_path, destination.as_path(), BindFlags::empty())
        .context("failed to bind into the container")?;

    conn.send_message(&SpawnResponse::default(), &[])
        .context("failed to send the bind-mount response")?;
    Ok(())
}

fn mkdir_unless_exists(path: &Path, mode: Mode) -> nix::Result<()> {
    match mkdir(path, mode) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(error) => Err(error),
    }
}

/// `mkdir -p` with ownership applied only to the components this call
/// actually creates; directories that already exist keep their owner.
fn mkdir_p_as(dir: &Path, uid: Uid, gid: Gid) -> nix::Result<()> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if current.as_os_str() == "/" {
            continue;
        }
        match mkdir(&current, Mode::from_bits_truncate(0o755)) {
            Ok(()) => chown(&current, Some(uid), Some(gid))?,
            Err(Errno::EEXIST) => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}
