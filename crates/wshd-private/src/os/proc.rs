use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag},
    },
    unistd::Pid,
};

/// A value that can be converted into an exit code.
pub trait IntoExitCode {
    /// Converts the current value into an exit code.
    fn report(&self) -> i32;
}

impl<T, E: IntoExitCode> IntoExitCode for Result<T, E> {
    fn report(&self) -> i32 {
        match self {
            Ok(_) => 0,
            Err(v) => v.report(),
        }
    }
}

impl IntoExitCode for anyhow::Error {
    fn report(&self) -> i32 {
        tracing::error!(?self, "process failed");
        -1
    }
}

impl IntoExitCode for i32 {
    fn report(&self) -> i32 {
        *self
    }
}

/// Owns a child pid; kills and reaps the child when dropped.
///
/// Call [`ChildProcess::forget`] once the child is supposed to outlive the
/// handle.
#[derive(Debug)]
pub struct ChildProcess(Option<Pid>);

impl From<Pid> for ChildProcess {
    fn from(value: Pid) -> Self {
        Self::new(value)
    }
}

impl ChildProcess {
    pub fn new(pid: Pid) -> Self {
        Self(Some(pid))
    }

    /// Gets the pid without taking ownership of it.
    pub fn inner(&self) -> Pid {
        self.0.expect("child already forgotten")
    }

    /// Forgets the child process and returns the pid.
    pub fn forget(mut self) -> Pid {
        self.0.take().expect("child already forgotten")
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let Some(pid) = self.0.take() else {
            return;
        };

        match kill(pid, Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return,
            Err(error) => {
                tracing::warn!(?pid, ?error, "failed to kill child process");
                return;
            }
        }

        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(error) => {
                    tracing::warn!(?pid, ?error, "failed to reap child process");
                    break;
                }
                Ok(_) => break,
            }
        }
    }
}
