use std::{
    convert::Infallible,
    os::{
        fd::{AsFd, AsRawFd, FromRawFd, OwnedFd},
        unix::net::UnixStream,
    },
};

use anyhow::Context as _;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::socket::{accept4, SockFlag},
};
use wshd_linux::{SignalSyscall as _, Syscall};
use wshd_model::{RequestKind, SpawnRequest};
use wshd_private::io::DomainSocket as _;

use crate::{exec, mount, reaper, state::Daemon};

/// The request loop: one thread, two descriptors, no shutdown path. The
/// daemon dies when its namespaces do.
pub fn run(mut daemon: Daemon) -> anyhow::Result<Infallible> {
    let mut sigchld = Syscall::sigchld_fd().context("failed to arm the signal descriptor")?;
    tracing::info!("serving requests");

    loop {
        let (conn_ready, chld_ready) = {
            let mut fds = [
                PollFd::new(daemon.listener.as_fd(), PollFlags::POLLIN),
                PollFd::new(sigchld.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(source).context("poll failed"),
                Ok(_) => {}
            }
            (ready(&fds[0]), ready(&fds[1]))
        };

        if conn_ready {
            accept_one(&mut daemon)?;
        }

        if chld_ready {
            // Level-triggered and non-blocking: drain one notification, then
            // reap everything that is currently waitable. Remaining
            // notifications re-arm the descriptor immediately.
            match sigchld.read_signal() {
                Ok(_) => reaper::reap(&mut daemon.children),
                Err(Errno::EAGAIN) => {}
                Err(source) => return Err(source).context("failed to read the signal descriptor"),
            }
        }
    }
}

fn ready(fd: &PollFd) -> bool {
    fd.revents()
        .is_some_and(|revents| revents.intersects(PollFlags::POLLIN))
}

/// Accepts and fully handles a single connection.
///
/// Spawn failures are the connection's problem: they are logged and the
/// daemon moves on. Mount injection failures are setup errors and fatal, as
/// is a broken listening socket.
fn accept_one(daemon: &mut Daemon) -> anyhow::Result<()> {
    let conn = match accept4(daemon.listener.as_raw_fd(), SockFlag::SOCK_CLOEXEC) {
        Ok(fd) => UnixStream::from(unsafe { OwnedFd::from_raw_fd(fd) }),
        Err(Errno::ECONNABORTED) | Err(Errno::EINTR) => return Ok(()),
        Err(source) => return Err(source).context("failed to accept a connection"),
    };

    let mut fds = Vec::new();
    let request: SpawnRequest = match conn.recv_message(&mut fds) {
        Ok(Some(request)) => request,
        Ok(None) => {
            tracing::trace!("peer closed without sending a request");
            return Ok(());
        }
        Err(error) => {
            tracing::warn!(?error, "failed to receive a request");
            return Ok(());
        }
    };
    // Any descriptors a peer smuggled alongside the request are dropped
    // here; requests carry none.
    drop(fds);

    match request.kind() {
        Ok(RequestKind::BindMount {
            source,
            destination,
            name,
        }) => mount::handle_bind_mount(daemon, &conn, source, destination, name),
        Ok(RequestKind::Interactive) => {
            if let Err(error) = exec::handle_interactive(daemon, &conn, &request) {
                tracing::warn!(?error, "interactive spawn failed");
            }
            Ok(())
        }
        Ok(RequestKind::NonInteractive) => {
            if let Err(error) = exec::handle_noninteractive(daemon, &conn, &request) {
                tracing::warn!(?error, "spawn failed");
            }
            Ok(())
        }
        Err(error) => {
            tracing::warn!(?error, "malformed request");
            Ok(())
        }
    }
}
