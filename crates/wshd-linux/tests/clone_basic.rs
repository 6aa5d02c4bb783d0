use anyhow::{bail, Context as _};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use wshd_linux::{CloneFlags, CloneSyscall as _, Syscall};
use wshd_test::{fork_test, init_test_logging};

fork_test! {
    fn clone_reports_the_callback_exit_code() -> anyhow::Result<()> {
        init_test_logging();
        let pid = Syscall::clone(Box::new(|| 7), CloneFlags::empty())?;
        match waitpid(pid, Some(WaitPidFlag::__WALL))
            .with_context(|| format!("failed to wait for {pid:?}"))?
        {
            WaitStatus::Exited(p, status) => {
                assert_eq!(pid, p);
                assert_eq!(status, 7);
                Ok(())
            }
            status => bail!("unexpected status {status:?}"),
        }
    }
}

fork_test! {
    fn clone_error_becomes_255() -> anyhow::Result<()> {
        init_test_logging();
        let pid = Syscall::clone(Box::new(|| -1), CloneFlags::empty())?;
        match waitpid(pid, Some(WaitPidFlag::__WALL))
            .with_context(|| format!("failed to wait for {pid:?}"))?
        {
            WaitStatus::Exited(p, status) => {
                assert_eq!(pid, p);
                assert_eq!(status, 255);
                Ok(())
            }
            status => bail!("unexpected status {status:?}"),
        }
    }
}

fork_test! {
    fn clone_fallback_path() -> anyhow::Result<()> {
        init_test_logging();
        let pid = Syscall::clone(Box::new(|| 0), CloneFlags::TEST_FALLBACK)?;
        match waitpid(pid, Some(WaitPidFlag::__WALL))
            .with_context(|| format!("failed to wait for {pid:?}"))?
        {
            WaitStatus::Exited(p, status) => {
                assert_eq!(pid, p);
                assert_eq!(status, 0);
                Ok(())
            }
            status => bail!("unexpected status {status:?}"),
        }
    }
}
