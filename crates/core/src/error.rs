use thiserror::Error;

pub type CdpResult<T> = Result<T, CdpError>;

#[derive(Error, Debug)]
pub enum CdpError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid argument `{field}`: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// An internal invariant no longer holds. Never corrected silently.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Profile store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CdpError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Fatal errors mean derived state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConsistencyViolation(_))
    }
}

impl From<config::ConfigError> for CdpError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
