use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use wshd_linux::{BindFlags, CloneFlags, FsSyscall as _, Pid, Syscall, UnmountFlags};
use wshd_test::{fork_test, init_test_logging};

mod common;

// The same sequence the container init performs: bind the new root onto
// itself, pivot with the old root parked underneath, then detach and remove
// the escape hatch.
fork_test! {
    fn pivot_parks_and_releases_the_old_root() -> Result<()> {
        init_test_logging();
        let pid = Pid::this().as_raw();

        common::as_root(
            Box::new(move || {
                Syscall::make_rslave("/").context("when making mounts slave")?;

                let root = PathBuf::from(format!("/tmp/pivot_root_{pid}"));
                std::fs::create_dir_all(root.join("tmp/oldroot"))
                    .context("when creating the new root")?;
                std::fs::write(root.join("marker"), "new root")
                    .context("when writing the marker")?;

                Syscall::bind(&root, &root, BindFlags::RECURSIVE)
                    .context("when binding the root onto itself")?;
                std::env::set_current_dir(&root).context("when entering the new root")?;

                Syscall::pivot(".", "tmp/oldroot").context("when pivoting")?;
                std::env::set_current_dir("/").context("when entering /")?;

                std::fs::read_to_string("/marker").context("when reading inside the new root")?;

                // The old root stays reachable until it is detached.
                anyhow::ensure!(
                    Path::new("/tmp/oldroot/tmp").exists(),
                    "old root not visible under the escape directory"
                );

                Syscall::unmount("/tmp/oldroot", UnmountFlags::DETACH)
                    .context("when detaching the old root")?;
                std::fs::remove_dir("/tmp/oldroot").context("when removing the escape dir")?;
                anyhow::ensure!(!Path::new("/tmp/oldroot").exists());

                Ok(())
            }),
            CloneFlags::NEWNS | CloneFlags::NEWPID,
        )
    }
}
