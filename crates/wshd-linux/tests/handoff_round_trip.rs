use anyhow::Result;
use nix::libc;
use serde::{Deserialize, Serialize};
use wshd_linux::{handoff, HANDOFF_FD};
use wshd_test::{fork_test, init_test_logging};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Carried {
    listen_fd: i32,
    title: String,
    dirs: Vec<String>,
}

// Claims the well-known descriptor, so it has to run in its own process.
fork_test! {
    fn staged_state_survives_until_recovered() -> Result<()> {
        init_test_logging();

        let state = Carried {
            listen_fd: 9,
            title: "wshd: test".into(),
            dirs: vec!["/var/run".into(), "/var/lib".into()],
        };

        handoff::stage(&state)?;

        // The parked descriptor must be inheritable: it has to survive the
        // exec between staging and recovery.
        let flags = unsafe { libc::fcntl(HANDOFF_FD, libc::F_GETFD) };
        anyhow::ensure!(flags != -1, "handoff fd not parked");
        anyhow::ensure!(
            flags & libc::FD_CLOEXEC == 0,
            "handoff fd would not survive exec"
        );

        let recovered: Carried = unsafe { handoff::recover() }?;
        anyhow::ensure!(recovered == state);

        // Recovery consumes the transport.
        let flags = unsafe { libc::fcntl(HANDOFF_FD, libc::F_GETFD) };
        anyhow::ensure!(flags == -1, "handoff fd still open after recovery");

        Ok(())
    }
}
