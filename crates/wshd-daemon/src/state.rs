use std::{
    collections::HashMap,
    os::{
        fd::{OwnedFd, RawFd},
        unix::net::UnixListener,
    },
    path::PathBuf,
};

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Name of the control socket inside the run directory.
pub const SOCKET_NAME: &str = "wshd.sock";

/// Where the old root is parked during the pivot. Transient: it must be gone
/// by the time the bootstrap handshake completes.
pub const HOST_ESCAPE_PATH: &str = "/tmp/garden-host";

/// In-container mount point mirroring the host-side volumes tree.
pub const CONTAINER_MOUNTS_PATH: &str = "/tmp/container-shared-mounts";

/// Everything the container init needs, from its clone through its re-exec.
///
/// Descriptors are carried by number: they stay open (and not close-on-exec)
/// from the moment the bootstrap creates them until the continuation wraps
/// them back into owned handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub run_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub root_dir: PathBuf,
    pub volumes_dir: PathBuf,
    pub title: String,

    /// Listening control socket, bound at `<run_dir>/wshd.sock`.
    pub listen_fd: RawFd,
    /// The parent's mount namespace as it was after the bootstrap unshared
    /// it; bind-mount injections re-enter it.
    pub host_mount_ns_fd: RawFd,
    /// Wait end of the barrier the parent signals to release the child.
    pub barrier_parent_wait: RawFd,
    /// Signal end of the barrier the continuation uses to acknowledge.
    pub barrier_child_signal: RawFd,
    /// Parent-only descriptors that rode along through clone; the child
    /// closes these first so barrier EOF detection works in both directions.
    pub close_in_child: Vec<RawFd>,
}

/// The live daemon, as assembled by the continuation.
pub struct Daemon {
    pub volumes_dir: PathBuf,
    pub listener: UnixListener,
    pub host_mount_ns: OwnedFd,
    /// Exit-status write ends, keyed by the child that owes them a status.
    ///
    /// An entry is inserted at fork and removed exactly once by the reaper;
    /// a pid missing from the map is a reparented stranger whose status is
    /// discarded.
    pub children: HashMap<Pid, OwnedFd>,
}
