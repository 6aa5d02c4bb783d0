use std::path::PathBuf;

use anyhow::{Context as _, Result};
use wshd_linux::{BindFlags, CloneFlags, FsSyscall as _, Pid, Syscall};
use wshd_test::{fork_test, init_test_logging};

mod common;

fork_test! {
    fn bind_makes_the_source_visible_at_the_target() -> Result<()> {
        init_test_logging();
        let pid = Pid::this().as_raw();

        common::as_root(
            Box::new(move || {
                Syscall::make_rslave("/").context("when making mounts slave")?;

                let source = PathBuf::from(format!("/tmp/bind_src_{pid}"));
                let target = PathBuf::from(format!("/tmp/bind_dst_{pid}"));
                std::fs::create_dir_all(&source).context("when creating the source")?;
                std::fs::create_dir_all(&target).context("when creating the target")?;
                std::fs::write(source.join("marker"), "payload")
                    .context("when writing the marker")?;

                Syscall::bind(&source, &target, BindFlags::empty())
                    .context("when bind mounting")?;

                let read = std::fs::read_to_string(target.join("marker"))
                    .context("when reading through the target")?;
                anyhow::ensure!(read == "payload");

                Ok(())
            }),
            CloneFlags::NEWNS,
        )
    }
}

fork_test! {
    fn self_bind_can_be_made_shared() -> Result<()> {
        init_test_logging();
        let pid = Pid::this().as_raw();

        common::as_root(
            Box::new(move || {
                Syscall::make_rslave("/").context("when making mounts slave")?;

                let dir = PathBuf::from(format!("/tmp/shared_vol_{pid}"));
                std::fs::create_dir_all(&dir).context("when creating the directory")?;

                Syscall::bind(&dir, &dir, BindFlags::empty())
                    .context("when binding onto itself")?;
                Syscall::make_shared(&dir).context("when marking shared")?;

                anyhow::ensure!(
                    wshd_linux::is_shared_mount(&dir) == Some(true),
                    "the volume tree should report as shared"
                );

                Ok(())
            }),
            CloneFlags::NEWNS,
        )
    }
}
