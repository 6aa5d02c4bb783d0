use std::{path::Path, process::Command};

use thiserror::Error;

pub const HOOK_PARENT_BEFORE_CLONE: &str = "hook-parent-before-clone.sh";
pub const HOOK_PARENT_AFTER_CLONE: &str = "hook-parent-after-clone.sh";
pub const HOOK_CHILD_BEFORE_PIVOT: &str = "hook-child-before-pivot.sh";
pub const HOOK_CHILD_AFTER_PIVOT: &str = "hook-child-after-pivot.sh";

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to run hook {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("hook {name} exited with {status}")]
    Failed {
        name: String,
        status: std::process::ExitStatus,
    },
}

/// Runs `<dir>/<name>` and propagates its exit status.
///
/// Hooks inherit the full environment of the phase they run in; the
/// after-clone hook relies on `PID` having been exported first.
pub fn run_hook(dir: &Path, name: &str) -> Result<(), HookError> {
    let path = dir.join(name);
    tracing::debug!(?path, "running hook");

    let status = Command::new(&path).status().map_err(|source| HookError::Spawn {
        name: name.to_string(),
        source,
    })?;

    if status.success() {
        tracing::trace!(?path, "hook succeeded");
        Ok(())
    } else {
        Err(HookError::Failed {
            name: name.to_string(),
            status,
        })
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt as _;

    use super::*;

    fn write_hook(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn zero_exit_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "hook-test.sh", "exit 0");
        run_hook(dir.path(), "hook-test.sh").unwrap();
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "hook-test.sh", "exit 3");
        match run_hook(dir.path(), "hook-test.sh") {
            Err(HookError::Failed { name, status }) => {
                assert_eq!(name, "hook-test.sh");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_hook_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            run_hook(dir.path(), "hook-test.sh"),
            Err(HookError::Spawn { .. })
        ));
    }
}
