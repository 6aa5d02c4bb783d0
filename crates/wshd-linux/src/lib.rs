mod barrier;
mod clone;
mod fd;
mod fs;
pub mod handoff;
mod ns;
mod proc;
mod pty;
mod signal;

use std::path::Path;

pub use barrier::*;
pub use clone::*;
pub use fd::*;
pub use fs::*;
pub use handoff::*;
pub use ns::*;
pub use proc::*;
pub use pty::*;
pub use signal::*;

pub use nix::unistd::Pid;

pub const NO_PATH: Option<&Path> = None::<&Path>;

pub struct Syscall;
