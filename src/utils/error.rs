use thiserror::Error;

/// Error taxonomy for the orchestrator core (spec.md §7).
///
/// Input and admission errors surface directly to clients as `error` frames;
/// runtime-operational errors are retriable; cleanup/teardown failures never
/// reach this type at all (they are counted in pool/network metrics instead).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("input too large: {0}")]
    InputTooLarge(String),

    #[error("language unsupported: {0}")]
    LanguageUnsupported(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("queue full")]
    QueueFull,

    #[error("queue timeout")]
    QueueTimeout,

    #[error("capacity exhausted")]
    Capacity,

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("subnet pool exhausted")]
    PoolExhausted,

    #[error("network create failed: {0}")]
    NetworkCreateFailed(String),

    #[error("session not found")]
    SessionNotFound,
}

impl CoreError {
    /// The wire error code used in `error` frames (spec.md §6/§7).
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::QueueFull => "QUEUE_FULL",
            CoreError::QueueTimeout => "QUEUE_TIMEOUT",
            CoreError::Capacity | CoreError::PoolExhausted => "CAPACITY",
            CoreError::RuntimeUnavailable(_) | CoreError::NetworkCreateFailed(_) => {
                "RUNTIME_UNAVAILABLE"
            }
            CoreError::InputTooLarge(_) => "INPUT_TOO_LARGE",
            CoreError::ConfigInvalid(_) => "CONFIG_INVALID",
            CoreError::LanguageUnsupported(_) => "LANGUAGE_UNSUPPORTED",
            CoreError::MalformedFrame(_) => "MALFORMED_FRAME",
            CoreError::SessionNotFound => "SESSION_NOT_FOUND",
            CoreError::Io(_) | CoreError::Docker(_) => "RUNTIME_UNAVAILABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
