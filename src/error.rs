use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForemanBotError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("publish failure: {0}")]
    PublishFailure(String),
    #[error("all transports failed: {0}")]
    AllTransportsFailed(String),
    #[error("command timed out")]
    Timeout,
    #[error("agent error: {0}")]
    Agent(String),
    #[error("protocol mismatch: expected {expected}, got {got}")]
    ProtocolMismatch { expected: String, got: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ForemanBotError {
    /// Publish-level failures advance the dispatcher to the next transport;
    /// everything else aborts the call.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            ForemanBotError::TransportUnavailable(_) | ForemanBotError::PublishFailure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ForemanBotError>;
