use tip_store::StoreError;

/// Error taxonomy for control-plane operations.
///
/// Transport layers map these onto external status codes without
/// re-deriving semantics; only `Internal` is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("connectivity: {0}")]
    Connectivity(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            StoreError::Backend(msg) => Self::Internal(msg),
        }
    }
}
