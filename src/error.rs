use thiserror::Error;

/// The supervisor's single error taxonomy.
///
/// Kept deliberately small and matched 1:1 to the categories the core
/// actually needs to distinguish, rather than growing one variant per call
/// site.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("membership violation: {0}")]
    MembershipViolation(String),

    #[error("authentication failure: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for CoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl CoreError {
    /// `true` for categories the error-handling design treats as transient
    /// and safe to retry on the next ticker iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Network(_))
    }

    /// `true` for categories that must unwind all the way to
    /// [`crate::supervisor::Supervisor::run`].
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Engine(_) | CoreError::Configuration(_) | CoreError::MembershipViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
