use crate::Kind;

/// Errors surfaced by resource clients. Version conflicts are kept distinct
/// from every other failure so callers can re-read and retry.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound { kind: Kind, namespace: String, name: String },
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists { kind: Kind, namespace: String, name: String },
    #[error("{kind} {namespace}/{name}: resource version conflict (have {given}, want {current})")]
    VersionConflict { kind: Kind, namespace: String, name: String, given: String, current: String },
    #[error("starting watch for {kind} in namespace {namespace:?}: {reason}")]
    WatchInit { kind: Kind, namespace: String, reason: String },
    #[error("converting {kind} {namespace}/{name}: {reason}")]
    Conversion { kind: Kind, namespace: String, name: String, reason: String },
    #[error("no client registered for kind {0}")]
    UnknownKind(Kind),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    pub fn not_found(kind: &Kind, namespace: &str, name: &str) -> Self {
        ClientError::NotFound { kind: kind.clone(), namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn already_exists(kind: &Kind, namespace: &str, name: &str) -> Self {
        ClientError::AlreadyExists { kind: kind.clone(), namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, ClientError::AlreadyExists { .. }) }
    pub fn is_version_conflict(&self) -> bool { matches!(self, ClientError::VersionConflict { .. }) }
}
