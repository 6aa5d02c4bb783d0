use anyhow::{bail, Context as _, Result};
use nix::{
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::wait::{waitpid, WaitStatus},
    unistd::{fork, ForkResult},
};
use std::os::fd::AsFd;
use wshd_linux::{SignalSyscall as _, Syscall};
use wshd_test::{fork_test, init_test_logging};

// Blocks SIGCHLD process-wide, so it has to run in its own process.
fork_test! {
    fn child_exit_is_observed_through_the_descriptor() -> Result<()> {
        init_test_logging();

        let mut sfd = Syscall::sigchld_fd()?;

        let child = match unsafe { fork() }.context("spawning a child")? {
            ForkResult::Child => std::process::exit(7),
            ForkResult::Parent { child } => child,
        };

        let pollfd = PollFd::new(sfd.as_fd(), PollFlags::POLLIN);
        poll(&mut [pollfd], PollTimeout::NONE).context("waiting for SIGCHLD readiness")?;

        let info = sfd
            .read_signal()
            .context("draining the signal")?
            .context("signal descriptor was ready but empty")?;
        anyhow::ensure!(info.ssi_pid == child.as_raw() as u32);

        match waitpid(child, None)? {
            WaitStatus::Exited(pid, 7) => {
                anyhow::ensure!(pid == child);
                Ok(())
            }
            other => bail!("unexpected status {other:?}"),
        }
    }
}
