use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpmError {
    /// Underlying transport could not be opened
    #[error("Connection error: {0}")]
    Connection(String),
    /// A required parameter is missing or out of range
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Backend is not connected")]
    NotConnected,
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },
    #[error("A scan is already running on this executor")]
    AlreadyRunning,
    #[error("Motion backend is owned by another running scan")]
    BackendBusy,
    /// Unexpected disconnect or malformed response mid-operation
    #[error("Hardware fault: {0}")]
    HardwareFault(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    /// A scan ended `Failed`; carries the recorded reason
    #[error("Scan failed: {0}")]
    ScanFailed(String),
    #[error("IO error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SpmError {
    pub fn invalid_state(operation: &str, state: impl std::fmt::Display) -> Self {
        SpmError::InvalidState {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }
}

impl From<config::ConfigError> for SpmError {
    fn from(error: config::ConfigError) -> Self {
        SpmError::Configuration(error.to_string())
    }
}
