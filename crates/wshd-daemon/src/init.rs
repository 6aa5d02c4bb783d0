use std::{
    convert::Infallible,
    ffi::CString,
    fs::Permissions,
    os::{
        fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::{fs::PermissionsExt as _, net::UnixListener},
    },
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use nix::{errno::Errno, fcntl::OFlag, sys::stat::Mode};
use wshd_linux::{
    handoff, set_cloexec, BindFlags, FsSyscall as _, NsSyscall as _, ProcSyscall as _, SignalHalf,
    Syscall, UnmountFlags, WaitHalf,
};

use crate::{
    cli::CONTINUE_FLAG,
    hooks::{self, HOOK_CHILD_AFTER_PIVOT, HOOK_CHILD_BEFORE_PIVOT},
    serve,
    state::{Daemon, DaemonState, CONTAINER_MOUNTS_PATH, HOST_ESCAPE_PATH},
};

/// Where `lib_dir` and `volumes_dir` remain reachable once the root has
/// been pivoted: their canonical host paths re-rooted under the escape
/// directory.
#[derive(Debug)]
struct PivotedPaths {
    lib_dir: PathBuf,
    volumes_dir: PathBuf,
}

impl PivotedPaths {
    /// Must run before the pivot: it canonicalizes against the host view.
    fn derive(state: &DaemonState) -> anyhow::Result<Self> {
        Ok(Self {
            lib_dir: escape_path(&state.lib_dir)?,
            volumes_dir: escape_path(&state.volumes_dir)?,
        })
    }
}

fn escape_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let resolved = dir
        .canonicalize()
        .with_context(|| format!("failed to resolve {dir:?}"))?;
    let relative = resolved
        .strip_prefix("/")
        .with_context(|| format!("{resolved:?} is not absolute"))?;
    Ok(Path::new(HOST_ESCAPE_PATH).join(relative))
}

/// Entry point of the cloned child: completes the namespace transition,
/// pivots the root, and replaces itself with the `--continue` image. Only
/// returns on error.
pub fn container_init(state: DaemonState) -> anyhow::Result<()> {
    // The executable has to be reachable for the re-exec at the end, after
    // the mount table has been turned inside out; grab it while /proc is
    // still the host's.
    let exe = open_self_exe().context("failed to open own executable")?;

    for fd in &state.close_in_child {
        let _ = nix::unistd::close(*fd);
    }

    let release = unsafe { WaitHalf::from_raw_fd(state.barrier_parent_wait) };
    release.wait().context("waiting for the parent's release")?;
    drop(release);

    hooks::run_hook(&state.lib_dir, HOOK_CHILD_BEFORE_PIVOT)?;

    let pivoted = PivotedPaths::derive(&state)?;

    // Shared mounts refuse to pivot. Converting to slave keeps receiving
    // host-side mounts (the volumes tree depends on that) without being a
    // member of any shared peer group.
    Syscall::make_rslave("/").context("failed to convert mounts to slave propagation")?;

    Syscall::bind(&state.root_dir, &state.root_dir, BindFlags::RECURSIVE)
        .context("failed to bind the new root onto itself")?;
    std::env::set_current_dir(&state.root_dir)
        .with_context(|| format!("failed to enter {:?}", state.root_dir))?;

    // Container contract: a world-writable, sticky /tmp.
    std::fs::set_permissions("tmp", Permissions::from_mode(0o1777))
        .context("failed to chmod tmp to 01777")?;

    match nix::unistd::mkdir("tmp/garden-host", Mode::S_IRWXU) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(source) => return Err(source).context("failed to create the escape directory"),
    }

    Syscall::pivot(".", "tmp/garden-host").context("failed to pivot the root")?;
    std::env::set_current_dir("/").context("failed to enter the pivoted root")?;

    nix::unistd::mkdir(
        CONTAINER_MOUNTS_PATH,
        Mode::from_bits_truncate(0o755),
    )
    .context("failed to create the shared mounts directory")?;
    Syscall::bind(
        &pivoted.volumes_dir,
        CONTAINER_MOUNTS_PATH,
        BindFlags::empty(),
    )
    .context("failed to bind the volumes tree into the container")?;

    hooks::run_hook(&pivoted.lib_dir, HOOK_CHILD_AFTER_PIVOT)?;

    handoff::stage(&state).context("failed to stage state for the continuation")?;

    let argv = [
        CString::new("wshd").unwrap(),
        CString::new(CONTINUE_FLAG).unwrap(),
    ];
    let env: Vec<CString> = std::env::vars()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect();
    nix::unistd::fexecve(exe.as_raw_fd(), &argv, &env)
        .context("failed to replace the process image")?;
    unreachable!("fexecve returned without an error");
}

/// Re-entry after the exec: reattach the handed-off state, seal the private
/// descriptors, finish the filesystem contract, acknowledge the parent, and
/// serve.
pub fn continue_daemon() -> anyhow::Result<Infallible> {
    let state: DaemonState = unsafe { handoff::recover() }.context("failed to recover state")?;

    let listener = unsafe { UnixListener::from_raw_fd(state.listen_fd) };
    let host_mount_ns = unsafe { OwnedFd::from_raw_fd(state.host_mount_ns_fd) };
    let acknowledge = unsafe { SignalHalf::from_raw_fd(state.barrier_child_signal) };

    // Nothing the daemon keeps for itself may ever appear in a spawned
    // child's descriptor table.
    set_cloexec(listener.as_fd(), true).context("failed to seal the control socket")?;
    set_cloexec(host_mount_ns.as_fd(), true).context("failed to seal the host namespace handle")?;
    set_cloexec(acknowledge.as_fd(), true).context("failed to seal the barrier")?;

    if !state.title.is_empty() {
        if let Err(error) = Syscall::set_process_title(&state.title) {
            tracing::warn!(?error, "failed to set the process title");
        }
    }

    // The escape hatch must not outlive the bootstrap.
    Syscall::unmount(HOST_ESCAPE_PATH, UnmountFlags::DETACH)
        .context("failed to detach the escape directory")?;
    std::fs::remove_dir(HOST_ESCAPE_PATH).context("failed to remove the escape directory")?;

    nix::unistd::setsid().context("failed to become a session leader")?;

    redirect_stdio_to_null().context("failed to detach stdio")?;

    acknowledge.signal().context("failed to acknowledge the parent")?;
    drop(acknowledge);

    let daemon = Daemon {
        volumes_dir: state.volumes_dir,
        listener,
        host_mount_ns,
        children: Default::default(),
    };
    serve::run(daemon)
}

fn open_self_exe() -> anyhow::Result<OwnedFd> {
    let fd = nix::fcntl::open(
        Path::new("/proc/self/exe"),
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// The daemon inherited the launcher's console; after the handshake it must
/// hold no descriptor onto it. Containers without a /dev/null get the
/// streams closed outright instead.
fn redirect_stdio_to_null() -> anyhow::Result<()> {
    let null = match nix::fcntl::open(Path::new("/dev/null"), OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => fd,
        Err(error) => {
            tracing::warn!(?error, "no usable /dev/null, closing stdio");
            for stdfd in 0..=2 as RawFd {
                let _ = nix::unistd::close(stdfd);
            }
            return Ok(());
        }
    };
    for stdfd in 0..=2 as RawFd {
        nix::unistd::dup2(null, stdfd).context("failed to redirect a standard stream")?;
    }
    if null > 2 {
        let _ = nix::unistd::close(null);
    }
    Ok(())
}
