use std::{
    os::{fd::{AsFd, AsRawFd}, unix::net::UnixListener},
    path::Path,
};

use anyhow::Context as _;
use wshd_linux::{
    is_shared_mount, set_cloexec, Barrier, BindFlags, CloneFlags, CloneSyscall as _, FsSyscall as _,
    NsSyscall as _, Syscall,
};
use wshd_private::os::proc::ChildProcess;

use crate::{
    cli::DaemonConfig,
    hooks::{self, HOOK_PARENT_AFTER_CLONE, HOOK_PARENT_BEFORE_CLONE},
    init,
    state::{DaemonState, SOCKET_NAME},
};

/// Parent-side bootstrap: prepares the outward surface, clones the container
/// init into fresh namespaces, and synchronises with it through the
/// barriers. Returns once the continuation has acknowledged.
pub fn run(config: &DaemonConfig) -> anyhow::Result<()> {
    let listener = bind_control_socket(&config.run_dir)?;

    let (parent_wait, parent_signal) = Barrier::open()
        .context("failed to open the release barrier")?
        .split();
    let (child_wait, child_signal) = Barrier::open()
        .context("failed to open the acknowledge barrier")?
        .split();

    // The hooks below may mount whatever they need without polluting the
    // wider system; the namespace captured here is also where bind-mount
    // injections will land later.
    Syscall::unshare_mount_ns().context("failed to unshare the mount namespace")?;
    let host_ns = Syscall::current_mount_ns_inheritable()
        .context("failed to capture the host mount namespace")?;

    // Self-bind plus shared marking puts the volumes tree in its own peer
    // group, so host-side mounts made under it keep appearing inside the
    // container for the daemon's whole lifetime.
    Syscall::bind(&config.volumes_dir, &config.volumes_dir, BindFlags::empty())
        .context("failed to bind the volumes tree onto itself")?;
    Syscall::make_shared(&config.volumes_dir)
        .context("failed to share the volumes tree")?;
    if is_shared_mount(&config.volumes_dir) != Some(true) {
        tracing::warn!(volumes = ?config.volumes_dir, "volumes tree does not report as shared");
    }

    hooks::run_hook(&config.lib_dir, HOOK_PARENT_BEFORE_CLONE)?;

    let state = DaemonState {
        run_dir: config.run_dir.clone(),
        lib_dir: config.lib_dir.clone(),
        root_dir: config.root_dir.clone(),
        volumes_dir: config.volumes_dir.clone(),
        title: config.title.clone(),
        listen_fd: listener.as_raw_fd(),
        host_mount_ns_fd: host_ns.as_raw_fd(),
        barrier_parent_wait: parent_wait.as_raw_fd(),
        barrier_child_signal: child_signal.as_raw_fd(),
        close_in_child: vec![parent_signal.as_raw_fd(), child_wait.as_raw_fd()],
    };

    let pid = Syscall::clone(
        move || init::container_init(state.clone()),
        CloneFlags::container_init(),
    )
    .context("failed to clone the container init")?;
    let child = ChildProcess::from(pid);

    // Drop the child's barrier halves so a dying child surfaces as EOF
    // rather than a hang.
    drop(parent_wait);
    drop(child_signal);

    std::env::set_var("PID", pid.to_string());
    hooks::run_hook(&config.lib_dir, HOOK_PARENT_AFTER_CLONE)?;

    parent_signal
        .signal()
        .context("error waking up the container init")?;
    child_wait
        .wait()
        .context("error waiting for acknowledgement from the container init")?;

    tracing::info!(?pid, "container init is serving");
    child.forget();
    Ok(())
}

/// Binds the control socket, replacing a stale one from an earlier run. The
/// descriptor must survive the container init's exec, so it is explicitly
/// made inheritable.
fn bind_control_socket(run_dir: &Path) -> anyhow::Result<UnixListener> {
    let path = run_dir.join(SOCKET_NAME);
    if path.exists() {
        tracing::trace!(?path, "cleaning up previous socket");
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove stale socket {path:?}"))?;
    }

    tracing::trace!(?path, "binding control socket");
    let listener =
        UnixListener::bind(&path).with_context(|| format!("failed to bind to {path:?}"))?;

    set_cloexec(listener.as_fd(), false).context("failed to make the control socket inheritable")?;
    Ok(listener)
}
