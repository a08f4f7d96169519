use hedgebot_core::BrokerError;

/// Errors raised by the ladder engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to place rung {index}: {source}")]
    RungPlacement {
        index: usize,
        #[source]
        source: BrokerError,
    },
    #[error("Invalid ladder transition: {0}")]
    InvalidTransition(String),
    #[error("State file error: {0}")]
    State(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::State(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::State(e.to_string())
    }
}
