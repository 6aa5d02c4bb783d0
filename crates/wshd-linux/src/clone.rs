// Portions adapted from: https://github.com/containers/youki/

use std::{
    ffi::{c_int, c_long},
    num::NonZeroUsize,
};

use crate::Syscall;

use nix::{
    errno::Errno,
    libc::{self, SIGCHLD},
    sched::CloneFlags as CloneF,
    sys::mman,
};

pub use nix::unistd::Pid;
use thiserror::Error;
use tracing::{span, Level, Span};
use wshd_private::os::proc::IntoExitCode;

#[derive(Debug, Clone, Error)]
#[error("failed to clone process: {source}")]
pub struct CloneError {
    #[source]
    source: Errno,
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CloneFlags: u64 {
        /// The cloned child is started in a new mount namespace.
        const NEWNS = CloneF::CLONE_NEWNS.bits() as u64;
        /// Create the process in a new UTS namespace.
        const NEWUTS = CloneF::CLONE_NEWUTS.bits() as u64;
        /// Create the process in a new IPC namespace.
        const NEWIPC = CloneF::CLONE_NEWIPC.bits() as u64;
        /// Create the process in a new user namespace.
        const NEWUSER = CloneF::CLONE_NEWUSER.bits() as u64;
        /// Create the process in a new PID namespace.
        const NEWPID = CloneF::CLONE_NEWPID.bits() as u64;
        /// Create the process in a new network namespace.
        const NEWNET = CloneF::CLONE_NEWNET.bits() as u64;
        #[doc(hidden)]
        const TEST_FALLBACK = 0x100000000;
    }
}

impl CloneFlags {
    /// The namespace set a container init is started in.
    pub fn container_init() -> Self {
        Self::NEWIPC | Self::NEWNET | Self::NEWNS | Self::NEWPID | Self::NEWUTS
    }
}

/// Syscalls related to cloning a process.
pub trait CloneSyscall {
    /// Clones the current process and invokes the `callback` inside the clone.
    fn clone<R: IntoExitCode + std::fmt::Debug, F: 'static + FnMut() -> R>(
        callback: F,
        flags: CloneFlags,
    ) -> Result<Pid, CloneError>;
}

impl CloneSyscall for Syscall {
    #[tracing::instrument(skip(callback), err(level = "debug"))]
    fn clone<R: IntoExitCode + std::fmt::Debug, F: 'static + FnMut() -> R>(
        mut callback: F,
        flags: CloneFlags,
    ) -> Result<Pid, CloneError> {
        let current = Span::current().id();
        let mut cb = Box::new(move || {
            let pid = Pid::this().as_raw();
            let new = span!(parent: None, Level::TRACE, "cloned", ?pid);
            new.follows_from(current.clone());
            let _span = new.entered();

            callback()
        });

        match clone3(&mut cb, flags) {
            Ok(pid) => Ok(pid),
            // Fall back to clone(2) only when the kernel lacks clone3.
            Err(Errno::ENOSYS) => {
                let flags = flags.difference(CloneFlags::TEST_FALLBACK).bits();
                let pid = clone_fallback(cb, flags).map_err(|source| CloneError { source })?;

                Ok(pid)
            }
            Err(source) => Err(CloneError { source }),
        }
    }
}

// clone3 mimicks fork: no stack management, so the callback can be invoked
// through a plain reference.
fn clone3<R: IntoExitCode + std::fmt::Debug, F: FnMut() -> R>(
    cb: &mut Box<F>,
    flags: CloneFlags,
) -> Result<Pid, Errno> {
    #[repr(C)]
    struct Clone3Args {
        flags: u64,
        pidfd: u64,
        child_tid: u64,
        parent_tid: u64,
        exit_signal: u64,
        stack: u64,
        stack_size: u64,
        tls: u64,
        set_tid: u64,
        set_tid_size: u64,
        cgroup: u64,
    }

    let flags = if flags.intersects(CloneFlags::TEST_FALLBACK) {
        return Err(Errno::ENOSYS);
    } else {
        flags.bits()
    };

    let mut args = Clone3Args {
        flags,
        pidfd: 0,
        child_tid: 0,
        parent_tid: 0,
        exit_signal: SIGCHLD as u64,
        stack: 0,
        stack_size: 0,
        tls: 0,
        set_tid: 0,
        set_tid_size: 0,
        cgroup: 0,
    };
    let args_ptr = &mut args as *mut Clone3Args;
    let args_size = std::mem::size_of::<Clone3Args>();

    // There is no libc wrapper for clone3 yet; the raw syscall skips libc's
    // fork bookkeeping, which this single-threaded daemon does not rely on.
    match unsafe { libc::syscall(libc::SYS_clone3, args_ptr, args_size) } {
        -1 => Err(Errno::last()).inspect_err(|error| {
            if *error == Errno::ENOSYS {
                tracing::trace!(?error, "failed to clone(3)")
            } else {
                tracing::debug!(?error, "failed to clone(3)")
            }
        }),
        0 => {
            // Inside the cloned process: run the callback and exit with its
            // report.
            std::process::exit(cb().report());
        }
        ret if ret >= 0 => Ok(Pid::from_raw(ret as i32))
            .inspect(|pid| tracing::trace!(?pid, "cloned using clone(3)")),
        _ => Err(Errno::UnknownErrno)
            .inspect_err(|_| tracing::debug!("clone(3) returned a negative pid")),
    }
}

fn clone_fallback<R: IntoExitCode + std::fmt::Debug, F: 'static + FnMut() -> R>(
    cb: Box<F>,
    flags: u64,
) -> Result<Pid, Errno> {
    const STACK_SIZE: usize = 8 * 1024 * 1024;
    const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

    let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .unwrap_or(Some(DEFAULT_PAGE_SIZE as c_long))
        .map(|size| size as usize)
        .unwrap_or(DEFAULT_PAGE_SIZE);

    // clone(2) needs a caller-supplied stack. mmap only reserves address
    // space up front, and exec resets the stack anyway, so a generous fixed
    // reservation is fine.
    let child_stack = unsafe {
        mman::mmap_anonymous(
            None,
            NonZeroUsize::new(STACK_SIZE).unwrap(),
            mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
            mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_ANONYMOUS | mman::MapFlags::MAP_STACK,
        )
        .inspect_err(|error| tracing::debug!(?error, "failed to allocate memory for the stack"))?
    };

    unsafe {
        // Guard page at the bottom; the stack grows down towards it.
        mman::mprotect(child_stack, page_size, mman::ProtFlags::PROT_NONE)
            .inspect_err(|error| tracing::debug!(?error, "failed to create guard page"))?
    };

    let child_stack_top = unsafe { child_stack.as_ptr().add(STACK_SIZE) };

    let combined_flags = (flags | SIGCHLD as u64) as c_int;

    // Double-box so the closure survives the cast through c_void; the child
    // re-boxes it inside clone_main. Consistent with how std spawns threads.
    let data = Box::into_raw(Box::new(cb));

    let ret = unsafe {
        libc::clone(
            clone_main::<R, F>,
            child_stack_top,
            combined_flags,
            data as *mut libc::c_void,
        )
    };

    // The child got its own copy of the heap; re-box here so the parent's
    // copy is released.
    unsafe { drop(Box::from_raw(data)) };
    match ret {
        -1 => Err(Errno::last()).inspect_err(|error| tracing::debug!(?error, "failed to clone(2)")),
        pid if ret > 0 => {
            Ok(Pid::from_raw(pid)).inspect(|pid| tracing::trace!(?pid, "cloned using clone(2)"))
        }
        _ => Err(Errno::UnknownErrno)
            .inspect_err(|_| tracing::debug!("clone(2) returned a negative pid")),
    }
}

extern "C" fn clone_main<R: IntoExitCode + std::fmt::Debug, F: 'static + FnMut() -> R>(
    data: *mut libc::c_void,
) -> libc::c_int {
    unsafe { Box::from_raw(data as *mut Box<F>)().report() }
}
