use std::{
    convert::Infallible,
    ffi::CString,
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    path::Path,
};

use anyhow::Context as _;
use nix::{
    errno::Errno,
    fcntl::OFlag,
    unistd::{chdir, dup2, execvpe, fork, pipe2, setsid, ForkResult, Pid, Uid},
};
use thiserror::Error;
use wshd_linux::{ProcSyscall as _, PtyError, PtyPair, PtySyscall as _, Syscall};
use wshd_model::{SpawnRequest, SpawnResponse};
use wshd_private::io::{DomainSocket as _, SocketMessageError};

use crate::state::Daemon;

const ROOT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const USER_PATH_ENV: &str = "/usr/local/bin:/usr/bin:/bin";

/// Exit status of a spawned child that never made it to exec.
const CHILD_SETUP_FAILED: i32 = 255;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to create a pipe: {0}")]
    Pipe(#[source] Errno),
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error("failed to send the response: {0}")]
    Send(#[source] SocketMessageError),
    #[error("failed to fork: {0}")]
    Fork(#[source] Errno),
}

/// Spawns a process wired to a fresh pseudo-terminal.
///
/// The client receives [pty master, exit-status read end] together with the
/// response record, before the child exists; everything this process keeps
/// is close-on-exec, so the spawned program observes only its own streams.
pub fn handle_interactive(
    daemon: &mut Daemon,
    conn: &UnixStream,
    request: &SpawnRequest,
) -> Result<(), SpawnError> {
    let (exit_rx, exit_tx) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
    let PtyPair { master, slave } = Syscall::openpty()?;

    conn.send_message(
        &SpawnResponse::default(),
        &[master.as_raw_fd(), exit_rx.as_raw_fd()],
    )
    .map_err(SpawnError::Send)?;
    drop(master);
    drop(exit_rx);

    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Child => child_main(
            request,
            slave.as_raw_fd(),
            slave.as_raw_fd(),
            slave.as_raw_fd(),
        ),
        ForkResult::Parent { child } => {
            track_child(daemon, child, exit_tx);
            Ok(())
        }
    }
}

/// Spawns a process wired to three plain pipes.
///
/// The client receives [stdin write, stdout read, stderr read, exit-status
/// read].
pub fn handle_noninteractive(
    daemon: &mut Daemon,
    conn: &UnixStream,
    request: &SpawnRequest,
) -> Result<(), SpawnError> {
    let (stdin_rx, stdin_tx) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
    let (stdout_rx, stdout_tx) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
    let (stderr_rx, stderr_tx) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
    let (exit_rx, exit_tx) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;

    conn.send_message(
        &SpawnResponse::default(),
        &[
            stdin_tx.as_raw_fd(),
            stdout_rx.as_raw_fd(),
            stderr_rx.as_raw_fd(),
            exit_rx.as_raw_fd(),
        ],
    )
    .map_err(SpawnError::Send)?;
    drop(stdin_tx);
    drop(stdout_rx);
    drop(stderr_rx);
    drop(exit_rx);

    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Child => child_main(
            request,
            stdin_rx.as_raw_fd(),
            stdout_tx.as_raw_fd(),
            stderr_tx.as_raw_fd(),
        ),
        ForkResult::Parent { child } => {
            track_child(daemon, child, exit_tx);
            Ok(())
        }
    }
}

fn track_child(daemon: &mut Daemon, child: Pid, exit_fd: OwnedFd) {
    tracing::debug!(?child, "spawned");
    if daemon.children.insert(child, exit_fd).is_some() {
        // A pid cannot be recycled while its previous incarnation is
        // unreaped; seeing this means the map leaked an entry.
        tracing::warn!(?child, "replaced a stale exit-status entry");
    }
}

fn child_main(request: &SpawnRequest, stdin: RawFd, stdout: RawFd, stderr: RawFd) -> ! {
    if let Err(error) = child_setup(request, stdin, stdout, stderr) {
        // Standard error already belongs to the client at this point; give
        // it the reason alongside the 255 status.
        eprintln!("wshd: {error:#}");
    }
    std::process::exit(CHILD_SETUP_FAILED)
}

fn child_setup(
    request: &SpawnRequest,
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
) -> anyhow::Result<Infallible> {
    dup2(stdin, 0).context("failed to wire stdin")?;
    dup2(stdout, 1).context("failed to wire stdout")?;
    dup2(stderr, 2).context("failed to wire stderr")?;

    setsid().context("failed to create a session")?;

    let user = Syscall::lookup_user(request.user.effective_name())?;

    if Syscall::is_tty(0) {
        Syscall::make_controlling_tty(0)?;
    }

    let argv = resolve_argv(&request.argv, &user.shell);

    Syscall::apply_rlimits(&request.rlimits)?;
    Syscall::set_identity(&user, request.user.uid, request.user.gid)?;

    chdir(&user.dir).with_context(|| format!("failed to enter home {:?}", user.dir))?;

    let target_uid = request.user.uid.map(Uid::from_raw).unwrap_or(user.uid);
    let env = build_env(&request.env, &user.name, &user.dir, target_uid.is_root());

    if let Some(dir) = &request.dir {
        chdir(dir.as_path()).with_context(|| format!("failed to enter {:?}", dir.as_path()))?;
    }

    let argv: Vec<CString> = argv
        .into_iter()
        .map(CString::new)
        .collect::<Result<_, _>>()
        .context("argument contains a NUL byte")?;
    let env: Vec<CString> = env
        .into_iter()
        .map(CString::new)
        .collect::<Result<_, _>>()
        .context("environment entry contains a NUL byte")?;

    let gone = execvpe(&argv[0], &argv, &env)
        .with_context(|| format!("failed to exec {:?}", argv[0]))?;
    match gone {}
}

/// The program to run: the request's argv, or the account's login shell, or
/// `/bin/sh`.
fn resolve_argv(requested: &[String], shell: &Path) -> Vec<String> {
    if !requested.is_empty() {
        return requested.to_vec();
    }
    if !shell.as_os_str().is_empty() {
        return vec![shell.display().to_string()];
    }
    vec!["/bin/sh".to_string()]
}

/// The request overlay first, then the fixed tail. Later entries do not
/// override earlier ones for lookups that take the first match, which
/// preserves the overlay's say on HOME and friends.
fn build_env(overlay: &[String], name: &str, home: &Path, root: bool) -> Vec<String> {
    let mut env = overlay.to_vec();
    env.push(format!("HOME={}", home.display()));
    env.push(format!("USER={name}"));
    env.push(format!(
        "PATH={}",
        if root { ROOT_PATH_ENV } else { USER_PATH_ENV }
    ));
    env
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn argv_defaults_to_the_login_shell() {
        assert_eq!(
            resolve_argv(&[], Path::new("/bin/bash")),
            vec!["/bin/bash".to_string()]
        );
    }

    #[test]
    fn argv_defaults_to_sh_without_a_shell() {
        assert_eq!(resolve_argv(&[], Path::new("")), vec!["/bin/sh".to_string()]);
    }

    #[test]
    fn requested_argv_wins() {
        let requested = vec!["/bin/echo".to_string(), "hello".to_string()];
        assert_eq!(resolve_argv(&requested, Path::new("/bin/bash")), requested);
    }

    #[test]
    fn root_gets_the_admin_path() {
        let env = build_env(&[], "root", Path::new("/root"), true);
        assert_eq!(
            env,
            vec![
                "HOME=/root".to_string(),
                "USER=root".to_string(),
                format!("PATH={ROOT_PATH_ENV}"),
            ]
        );
    }

    #[test]
    fn others_get_the_user_path() {
        let env = build_env(&["FOO=bar".to_string()], "vcap", Path::new("/home/vcap"), false);
        assert_eq!(
            env,
            vec![
                "FOO=bar".to_string(),
                "HOME=/home/vcap".to_string(),
                "USER=vcap".to_string(),
                format!("PATH={USER_PATH_ENV}"),
            ]
        );
    }
}
