use nix::{
    errno::Errno,
    sys::{
        signal::{sigprocmask, SigmaskHow, Signal},
        signalfd::{SfdFlags, SigSet, SignalFd},
    },
};
use thiserror::Error;

use crate::Syscall;

#[derive(Debug, Clone, Error)]
pub enum SignalError {
    #[error("failed to block SIGCHLD: {0}")]
    Block(#[source] Errno),
    #[error("failed to create a signal descriptor: {0}")]
    Create(#[source] Errno),
}

pub trait SignalSyscall {
    /// Routes SIGCHLD through a descriptor.
    ///
    /// The signal is blocked from asynchronous delivery first, so child
    /// terminations are only ever observed by reading the returned
    /// descriptor. Non-blocking and close-on-exec.
    fn sigchld_fd() -> Result<SignalFd, SignalError>;
}

impl SignalSyscall for Syscall {
    #[tracing::instrument(err(level = "debug"))]
    fn sigchld_fd() -> Result<SignalFd, SignalError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);

        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .inspect_err(|error| tracing::debug!(?error, "failed to block SIGCHLD"))
            .map_err(SignalError::Block)?;

        SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .inspect_err(|error| tracing::debug!(?error, "failed to create signalfd"))
            .inspect(|_| tracing::trace!("created SIGCHLD descriptor"))
            .map_err(SignalError::Create)
    }
}
