use chorus_core::errors::ClientError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("coordinator '{0}' is unavailable")]
    CoordinatorUnavailable(String),

    #[error("client error: {0}")]
    Client(#[from] ClientError),
}
