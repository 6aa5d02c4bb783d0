use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

/// Longest process title, in bytes; anything longer is silently truncated.
const MAX_TITLE_BYTES: usize = 31;

/// Selects re-entry after the in-container exec. Checked before normal
/// option parsing; it must be the only argument.
pub const CONTINUE_FLAG: &str = "--continue";

#[derive(Debug, Parser)]
#[command(
    name = "wshd",
    about = "Per-container init daemon serving spawn and bind-mount requests"
)]
pub struct Cli {
    /// Directory where the control socket is placed.
    #[arg(long, value_name = "DIR", default_value = "run")]
    pub run: PathBuf,

    /// Directory containing the hook scripts.
    #[arg(long, value_name = "DIR", default_value = "lib")]
    pub lib: PathBuf,

    /// Directory that becomes the root of the container.
    #[arg(long, value_name = "DIR", default_value = "root")]
    pub root: PathBuf,

    /// Host-side tree that carries bind-mounted volumes into the container.
    #[arg(long, value_name = "DIR")]
    pub volumes: PathBuf,

    /// Cosmetic process title.
    #[arg(long, value_name = "NAME", default_value = "")]
    pub title: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to resolve {path:?}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Validated launcher configuration; all paths absolute and known to exist.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub run_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub root_dir: PathBuf,
    pub volumes_dir: PathBuf,
    pub title: String,
}

impl Cli {
    pub fn validate(self) -> Result<DaemonConfig, ConfigError> {
        Ok(DaemonConfig {
            run_dir: resolve_dir(self.run)?,
            lib_dir: resolve_dir(self.lib)?,
            root_dir: resolve_dir(self.root)?,
            volumes_dir: resolve_dir(self.volumes)?,
            title: truncate_title(self.title),
        })
    }
}

/// True when the process was started as the post-exec continuation.
pub fn is_continuation(args: &[String]) -> bool {
    args.len() == 2 && args[1] == CONTINUE_FLAG
}

fn resolve_dir(path: PathBuf) -> Result<PathBuf, ConfigError> {
    let resolved = path.canonicalize().map_err(|source| ConfigError::Resolve {
        path: path.clone(),
        source,
    })?;
    if !resolved.is_dir() {
        return Err(ConfigError::NotADirectory(path));
    }
    Ok(resolved)
}

fn truncate_title(mut title: String) -> String {
    if title.len() > MAX_TITLE_BYTES {
        let mut end = MAX_TITLE_BYTES;
        while !title.is_char_boundary(end) {
            end -= 1;
        }
        title.truncate(end);
    }
    title
}
