use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("etcd error: {0}")]
    Etcd(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StateError {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, StateError::KeyNotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("requested {what} not available - {label}:{value}")]
    NotAvailable {
        what: &'static str,
        label: &'static str,
        value: u32,
    },
    #[error("no {0} available")]
    Exhausted(&'static str),
    #[error("Resource with id: {0:?} already exists")]
    AlreadyExists(String),
    #[error("No resource found for description: {desc:?} and id: {id:?}")]
    NotFound { desc: String, id: String },
    #[error("No resource found for description: {0:?}")]
    UnknownKind(String),
    #[error("{0}")]
    InvalidConfig(String),
    #[error("state-based resource manager instance already exists.")]
    SingletonExists,
    #[error("state-based resource manager instance doesn't exist.")]
    SingletonMissing,
    #[error(transparent)]
    State(#[from] StateError),
}

pub type Result<T, E = ResourceError> = std::result::Result<T, E>;

/// True when the error, however deeply wrapped, is a missing-key condition.
pub fn is_key_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<StateError>()
            .is_some_and(StateError::is_key_not_found)
            || cause.downcast_ref::<ResourceError>().is_some_and(|e| {
                matches!(e, ResourceError::State(inner) if inner.is_key_not_found())
            })
    })
}
