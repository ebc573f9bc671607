//! Error taxonomy shared by stores, caches and the controller runtime.

use crate::{ObjectKey, ResourceVersion};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The object vanished between trigger and read. Terminal for a reconcile, not a failure.
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    /// A write carried a stale resourceVersion; re-read, recompute and retry.
    #[error("conflict on {key}: expected resourceVersion {expected}, found {actual}")]
    Conflict { key: ObjectKey, expected: ResourceVersion, actual: ResourceVersion },
    #[error("already exists: {0}")]
    AlreadyExists(ObjectKey),
    /// Store unavailable, timeout or cancelled call. Retried through queue backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Watch cursor too old to resume from; the informer relists.
    #[error("watch cursor expired: {0}")]
    Expired(String),
    #[error("mapping: {0}")]
    Mapping(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    /// Malformed registration at startup. The only class that stops the process.
    #[error("fatal config: {0}")]
    FatalConfig(String),
}

impl Error {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::AlreadyExists(_) => "already_exists",
            Error::Transient(_) => "transient",
            Error::Expired(_) => "expired",
            Error::Mapping(_) => "mapping",
            Error::Invalid(_) => "invalid",
            Error::FatalConfig(_) => "fatal_config",
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict { .. }) }
    pub fn is_fatal(&self) -> bool { matches!(self, Error::FatalConfig(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
