#![allow(unused)]

use std::{
    io::{prelude::Read, ErrorKind, Write},
    os::unix::net::UnixStream,
};

use anyhow::{bail, Context};
use nix::{
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::{setresgid, setresuid, Gid, Uid},
};
use wshd_linux::{CloneFlags, CloneSyscall as _, Syscall};

/// Clones into fresh namespaces and becomes root inside a user namespace
/// before running `callback`.
///
/// Mount and pivot tests need CAP_SYS_ADMIN; a new user namespace with the
/// current user mapped to root provides it without requiring the suite to
/// run privileged. The flags must include NEWUSER.
pub fn as_root<F: 'static + FnMut() -> anyhow::Result<()>>(
    mut callback: F,
    flags: CloneFlags,
) -> anyhow::Result<()> {
    let my_uid = Uid::current().as_raw();
    let my_gid = Gid::current().as_raw();
    let (mut outer, mut inner) = UnixStream::pair().context("when creating socket")?;

    let pid = Syscall::clone(
        Box::new(move || {
            std::fs::write("/proc/self/uid_map", format!("0 {my_uid} 1"))
                .context("when mapping the uid")?;
            std::fs::write("/proc/self/setgroups", "deny").context("when denying setgroups")?;
            std::fs::write("/proc/self/gid_map", format!("0 {my_gid} 1"))
                .context("when mapping the gid")?;
            setresuid(Uid::from_raw(0), Uid::from_raw(0), Uid::from_raw(0))
                .context("when switching to the root user")?;
            setresgid(Gid::from_raw(0), Gid::from_raw(0), Gid::from_raw(0))
                .context("when switching to the root group")?;
            let result = callback();
            outer.write_all(&[0]).ok();
            result
        }),
        flags | CloneFlags::NEWUSER,
    )?;

    match waitpid(pid, Some(WaitPidFlag::__WALL))
        .with_context(|| format!("failed to wait for test implementation {pid:?}"))?
    {
        WaitStatus::Exited(_, status) => {
            assert_eq!(status, 0, "the child process tests passed");
        }
        other => bail!("unexpected wait result {other:?}"),
    }

    let mut inner_read = [0u8; 1];
    inner.set_nonblocking(true).ok();

    match inner.read(&mut inner_read) {
        Ok(1) => Ok(()),
        Err(e) if e.kind() != ErrorKind::WouldBlock => Err(e)?,
        _ => bail!("child process paniced"),
    }
}
