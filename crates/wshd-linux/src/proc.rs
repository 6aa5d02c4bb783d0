use std::ffi::CString;

use nix::{
    errno::Errno,
    sys::resource::{setrlimit, Resource},
    unistd::{initgroups, setgid, setuid, Gid, Uid, User},
};
use thiserror::Error;
use wshd_model::{LimitKind, ResourceLimits};

use crate::Syscall;

#[derive(Debug, Error)]
pub enum UserLookupError {
    #[error("failed to read the password database: {0}")]
    Database(#[source] Errno),
    #[error("no such user: {0:?}")]
    NotFound(String),
    #[error("user name {0:?} contains a NUL byte")]
    BadName(String),
}

#[derive(Debug, Clone, Error)]
#[error("failed to apply identity of {name:?}: {source}")]
pub struct IdentityError {
    name: String,
    #[source]
    source: Errno,
}

#[derive(Debug, Clone, Error)]
#[error("failed to set {kind:?} resource limit: {source}")]
pub struct RlimitError {
    kind: LimitKind,
    #[source]
    source: Errno,
}

#[derive(Debug, Clone, Error)]
#[error("failed to set the process title: {source}")]
pub struct TitleError {
    #[source]
    source: Errno,
}

pub trait ProcSyscall {
    fn lookup_user(name: &str) -> Result<User, UserLookupError>;

    /// Becomes `user`: supplementary groups, then gid, then uid last so the
    /// permission to switch is not dropped halfway.
    ///
    /// Explicit ids override the ones from the password database.
    fn set_identity(
        user: &User,
        uid_override: Option<u32>,
        gid_override: Option<u32>,
    ) -> Result<(), IdentityError>;

    fn apply_rlimits(limits: &ResourceLimits) -> Result<(), RlimitError>;

    fn set_process_title(title: &str) -> Result<(), TitleError>;
}

impl ProcSyscall for Syscall {
    fn lookup_user(name: &str) -> Result<User, UserLookupError> {
        User::from_name(name)
            .map_err(UserLookupError::Database)?
            .ok_or_else(|| UserLookupError::NotFound(name.to_string()))
    }

    #[tracing::instrument(skip_all, fields(name = %user.name), err(level = "debug"))]
    fn set_identity(
        user: &User,
        uid_override: Option<u32>,
        gid_override: Option<u32>,
    ) -> Result<(), IdentityError> {
        let err = |source| IdentityError {
            name: user.name.clone(),
            source,
        };

        let uid = uid_override.map(Uid::from_raw).unwrap_or(user.uid);
        let gid = gid_override.map(Gid::from_raw).unwrap_or(user.gid);

        let name = CString::new(user.name.as_str()).map_err(|_| err(Errno::EINVAL))?;
        initgroups(&name, gid).map_err(err)?;
        setgid(gid).map_err(err)?;
        setuid(uid).map_err(err)?;

        Ok(())
    }

    fn apply_rlimits(limits: &ResourceLimits) -> Result<(), RlimitError> {
        for (kind, value) in limits.entries() {
            setrlimit(resource_for(kind), value.soft, value.hard)
                .map_err(|source| RlimitError { kind, source })?;
        }
        Ok(())
    }

    fn set_process_title(title: &str) -> Result<(), TitleError> {
        prctl::set_name(title).map_err(|raw| TitleError {
            source: Errno::from_raw(raw),
        })
    }
}

fn resource_for(kind: LimitKind) -> Resource {
    match kind {
        LimitKind::As => Resource::RLIMIT_AS,
        LimitKind::Core => Resource::RLIMIT_CORE,
        LimitKind::Cpu => Resource::RLIMIT_CPU,
        LimitKind::Data => Resource::RLIMIT_DATA,
        LimitKind::Fsize => Resource::RLIMIT_FSIZE,
        LimitKind::Locks => Resource::RLIMIT_LOCKS,
        LimitKind::Memlock => Resource::RLIMIT_MEMLOCK,
        LimitKind::Msgqueue => Resource::RLIMIT_MSGQUEUE,
        LimitKind::Nice => Resource::RLIMIT_NICE,
        LimitKind::Nofile => Resource::RLIMIT_NOFILE,
        LimitKind::Nproc => Resource::RLIMIT_NPROC,
        LimitKind::Rss => Resource::RLIMIT_RSS,
        LimitKind::Rtprio => Resource::RLIMIT_RTPRIO,
        LimitKind::Sigpending => Resource::RLIMIT_SIGPENDING,
        LimitKind::Stack => Resource::RLIMIT_STACK,
    }
}
