use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BoundedName, BoundedPath};

/// One request, one connection.
///
/// A single record shape carries both process spawns and bind-mount
/// injections; the presence of both bind paths routes the record to the
/// mount injector, otherwise the `tty` flag picks the spawn variant. The
/// field-presence rule is load-bearing for existing clients and must not
/// change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub tty: bool,
    /// Program and arguments; empty means "the target user's shell".
    pub argv: Vec<String>,
    /// `KEY=VALUE` pairs prepended to the environment built for the child.
    pub env: Vec<String>,
    /// Working directory override; applied after the home-directory chdir.
    pub dir: Option<BoundedPath>,
    pub user: UserSpec,
    pub rlimits: ResourceLimits,
    pub bind_source: Option<BoundedPath>,
    pub bind_destination: Option<BoundedPath>,
    pub bind_name: Option<BoundedName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("bind mount request is missing its name")]
    MissingBindName,
    #[error("bind mount request has a source but no destination")]
    MissingBindDestination,
    #[error("bind mount request has a destination but no source")]
    MissingBindSource,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RequestKind<'a> {
    BindMount {
        source: &'a BoundedPath,
        destination: &'a BoundedPath,
        name: &'a BoundedName,
    },
    Interactive,
    NonInteractive,
}

impl SpawnRequest {
    /// Applies the dispatch rule.
    pub fn kind(&self) -> Result<RequestKind<'_>, DispatchError> {
        match (&self.bind_source, &self.bind_destination) {
            (Some(source), Some(destination)) => {
                let name = self
                    .bind_name
                    .as_ref()
                    .ok_or(DispatchError::MissingBindName)?;
                Ok(RequestKind::BindMount {
                    source,
                    destination,
                    name,
                })
            }
            (Some(_), None) => Err(DispatchError::MissingBindDestination),
            (None, Some(_)) => Err(DispatchError::MissingBindSource),
            (None, None) if self.tty => Ok(RequestKind::Interactive),
            (None, None) => Ok(RequestKind::NonInteractive),
        }
    }
}

/// Target account for a spawned process.
///
/// An empty name resolves to `root`. The optional ids override what the
/// password database returns for the account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl UserSpec {
    pub fn effective_name(&self) -> &str {
        if self.name.is_empty() {
            "root"
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlimitValue {
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LimitKind {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Locks,
    Memlock,
    Msgqueue,
    Nice,
    Nofile,
    Nproc,
    Rss,
    Rtprio,
    Sigpending,
    Stack,
}

/// Per-request resource-limit overlay; unset fields leave the inherited
/// limit alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub r#as: Option<RlimitValue>,
    pub core: Option<RlimitValue>,
    pub cpu: Option<RlimitValue>,
    pub data: Option<RlimitValue>,
    pub fsize: Option<RlimitValue>,
    pub locks: Option<RlimitValue>,
    pub memlock: Option<RlimitValue>,
    pub msgqueue: Option<RlimitValue>,
    pub nice: Option<RlimitValue>,
    pub nofile: Option<RlimitValue>,
    pub nproc: Option<RlimitValue>,
    pub rss: Option<RlimitValue>,
    pub rtprio: Option<RlimitValue>,
    pub sigpending: Option<RlimitValue>,
    pub stack: Option<RlimitValue>,
}

impl ResourceLimits {
    /// The limits that are actually set, in a stable order.
    pub fn entries(&self) -> impl Iterator<Item = (LimitKind, RlimitValue)> + '_ {
        [
            (LimitKind::As, self.r#as),
            (LimitKind::Core, self.core),
            (LimitKind::Cpu, self.cpu),
            (LimitKind::Data, self.data),
            (LimitKind::Fsize, self.fsize),
            (LimitKind::Locks, self.locks),
            (LimitKind::Memlock, self.memlock),
            (LimitKind::Msgqueue, self.msgqueue),
            (LimitKind::Nice, self.nice),
            (LimitKind::Nofile, self.nofile),
            (LimitKind::Nproc, self.nproc),
            (LimitKind::Rss, self.rss),
            (LimitKind::Rtprio, self.rtprio),
            (LimitKind::Sigpending, self.sigpending),
            (LimitKind::Stack, self.stack),
        ]
        .into_iter()
        .filter_map(|(kind, value)| value.map(|value| (kind, value)))
    }
}

/// Fixed status record sent back on every connection.
///
/// The payload that matters is the descriptor list attached alongside:
/// two descriptors for an interactive spawn, four for a non-interactive
/// one, none for a bind mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub status: u32,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bind_request() -> SpawnRequest {
        SpawnRequest {
            bind_source: Some(BoundedPath::new("/data/x").unwrap()),
            bind_destination: Some(BoundedPath::new("/mnt/x").unwrap()),
            bind_name: Some(BoundedName::new("x").unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn dispatch_bind_mount() {
        let req = bind_request();
        assert!(matches!(req.kind(), Ok(RequestKind::BindMount { .. })));

        // The bind fields win even when tty is set.
        let mut req = bind_request();
        req.tty = true;
        assert!(matches!(req.kind(), Ok(RequestKind::BindMount { .. })));
    }

    #[test]
    fn dispatch_spawn() {
        let mut req = SpawnRequest::default();
        assert_eq!(req.kind(), Ok(RequestKind::NonInteractive));
        req.tty = true;
        assert_eq!(req.kind(), Ok(RequestKind::Interactive));
    }

    #[test]
    fn dispatch_half_bind() {
        let mut req = bind_request();
        req.bind_destination = None;
        assert_eq!(req.kind(), Err(DispatchError::MissingBindDestination));

        let mut req = bind_request();
        req.bind_source = None;
        assert_eq!(req.kind(), Err(DispatchError::MissingBindSource));

        let mut req = bind_request();
        req.bind_name = None;
        assert_eq!(req.kind(), Err(DispatchError::MissingBindName));
    }

    #[test]
    fn empty_user_is_root() {
        assert_eq!(UserSpec::default().effective_name(), "root");
        let named = UserSpec {
            name: "vcap".into(),
            ..Default::default()
        };
        assert_eq!(named.effective_name(), "vcap");
    }

    #[test]
    fn limit_entries_skip_unset() {
        let limits = ResourceLimits {
            nofile: Some(RlimitValue {
                soft: 1024,
                hard: 4096,
            }),
            ..Default::default()
        };
        let entries: Vec<_> = limits.entries().collect();
        assert_eq!(
            entries,
            vec![(
                LimitKind::Nofile,
                RlimitValue {
                    soft: 1024,
                    hard: 4096
                }
            )]
        );
    }
}
