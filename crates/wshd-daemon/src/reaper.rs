use std::{collections::HashMap, os::fd::OwnedFd};

use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};

/// Drains every currently-reapable child and settles its exit-status debt.
///
/// Runs only from the request loop, so inserts (at fork) and removals
/// (here) never race.
pub fn reap(children: &mut HashMap<Pid, OwnedFd>) {
    loop {
        let status = loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Err(Errno::EINTR) => continue,
                other => break other,
            }
        };

        match status {
            Ok(WaitStatus::Exited(pid, code)) => deliver(children, pid, Some(code)),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                tracing::debug!(?pid, ?signal, "child killed by signal");
                deliver(children, pid, None);
            }
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return,
            Ok(other) => tracing::trace!(?other, "ignoring wait status"),
            Err(error) => {
                tracing::warn!(?error, "waitpid failed");
                return;
            }
        }
    }
}

/// Writes the four status bytes (little endian) and closes the channel; a
/// signal death writes nothing, so the client reads a bare EOF. Pids nobody
/// registered were reparented into the container from elsewhere and are
/// dropped silently.
fn deliver(children: &mut HashMap<Pid, OwnedFd>, pid: Pid, code: Option<i32>) {
    let Some(exit_fd) = children.remove(&pid) else {
        tracing::trace!(?pid, "reaped a process nobody is waiting on");
        return;
    };

    if let Some(code) = code {
        tracing::debug!(?pid, code, "child exited");
        if let Err(error) = write_all(&exit_fd, &code.to_le_bytes()) {
            tracing::warn!(?pid, ?error, "failed to deliver an exit status");
        }
    }
    // Dropping exit_fd is the EOF the client is promised.
}

fn write_all(fd: &OwnedFd, mut buf: &[u8]) -> nix::Result<()> {
    while !buf.is_empty() {
        match nix::unistd::write(fd, buf) {
            Ok(written) => buf = &buf[written..],
            Err(Errno::EINTR) => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{io::Read as _, time::Duration};

    use nix::unistd::{fork, ForkResult};
    use pretty_assertions::assert_eq;

    use super::*;

    fn exit_channel() -> (std::fs::File, OwnedFd) {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        (std::fs::File::from(rx), tx)
    }

    #[test]
    fn normal_exit_writes_status_then_eof() {
        let mut children = HashMap::new();
        let (mut client, exit_fd) = exit_channel();
        let pid = Pid::from_raw(4242);
        children.insert(pid, exit_fd);

        deliver(&mut children, pid, Some(7));
        assert!(children.is_empty());

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, 7i32.to_le_bytes());
    }

    #[test]
    fn signal_death_is_a_bare_eof() {
        let mut children = HashMap::new();
        let (mut client, exit_fd) = exit_channel();
        let pid = Pid::from_raw(4242);
        children.insert(pid, exit_fd);

        deliver(&mut children, pid, None);
        assert!(children.is_empty());

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"");
    }

    #[test]
    fn unknown_pids_are_ignored() {
        let mut children = HashMap::new();
        let (_client, exit_fd) = exit_channel();
        children.insert(Pid::from_raw(1), exit_fd);

        deliver(&mut children, Pid::from_raw(2), Some(0));
        assert_eq!(children.len(), 1);
    }

    // Waits on any child, so it cannot share a process with tests that
    // spawn their own.
    wshd_test::fork_test! {
        fn reap_settles_a_real_child() -> anyhow::Result<()> {
            let mut children = HashMap::new();
            let (mut client, exit_fd) = exit_channel();

            let pid = match unsafe { fork() }? {
                ForkResult::Child => std::process::exit(9),
                ForkResult::Parent { child } => child,
            };
            children.insert(pid, exit_fd);

            // The child needs a moment to die; reap keeps coming back empty
            // until it does.
            let mut tries = 0;
            while !children.is_empty() {
                reap(&mut children);
                tries += 1;
                anyhow::ensure!(tries < 500, "child was never reaped");
                std::thread::sleep(Duration::from_millis(2));
            }

            let mut buf = Vec::new();
            client.read_to_end(&mut buf)?;
            assert_eq!(buf, 9i32.to_le_bytes());
            Ok(())
        }
    }
}
