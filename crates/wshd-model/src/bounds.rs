use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest path accepted in a request field, in bytes.
///
/// Matches the kernel's PATH_MAX minus the terminating byte: a 4095-byte
/// path is accepted, a 4096-byte path is rejected.
pub const MAX_PATH_BYTES: usize = 4095;

/// Longest single mount name accepted in a request, in bytes.
pub const MAX_NAME_BYTES: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundsError {
    #[error("path is {len} bytes, limit is {MAX_PATH_BYTES}")]
    PathTooLong { len: usize },
    #[error("name is {len} bytes, limit is {MAX_NAME_BYTES}")]
    NameTooLong { len: usize },
    #[error("name is empty")]
    EmptyName,
    #[error("name {0:?} is not a single path component")]
    NotAComponent(String),
}

/// A request path no longer than [`MAX_PATH_BYTES`].
///
/// The bound is enforced on construction and again on deserialization, so a
/// peer cannot smuggle an oversized path past the wire layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct BoundedPath(PathBuf);

impl BoundedPath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, BoundsError> {
        let path = path.into();
        let len = path.as_os_str().len();
        if len > MAX_PATH_BYTES {
            return Err(BoundsError::PathTooLong { len });
        }
        Ok(Self(path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl TryFrom<PathBuf> for BoundedPath {
    type Error = BoundsError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BoundedPath> for PathBuf {
    fn from(value: BoundedPath) -> Self {
        value.0
    }
}

impl AsRef<Path> for BoundedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// A non-empty single path component no longer than [`MAX_NAME_BYTES`].
///
/// Used for mount names that are joined under the volumes tree; a separator
/// inside the name would escape it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoundedName(String);

impl BoundedName {
    pub fn new(name: impl Into<String>) -> Result<Self, BoundsError> {
        let name = name.into();
        if name.is_empty() {
            return Err(BoundsError::EmptyName);
        }
        if name.len() > MAX_NAME_BYTES {
            return Err(BoundsError::NameTooLong { len: name.len() });
        }
        if name.contains(['/', '\0']) || name == "." || name == ".." {
            return Err(BoundsError::NotAComponent(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BoundedName {
    type Error = BoundsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BoundedName> for String {
    fn from(value: BoundedName) -> Self {
        value.0
    }
}

impl std::fmt::Display for BoundedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
