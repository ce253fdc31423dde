use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors reported by a registry client
#[derive(Error, Debug)]
pub enum ClientError {
    /// The registry reports that the service has no instances left
    #[error("hosts is empty for service {0}")]
    NoHosts(String),

    #[error("registry request failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("unexpected registry response: {0}")]
    Response(String),

    #[error("registry authentication failed: {0}")]
    Auth(String),
}

impl ClientError {
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ClientError::Transport(Box::new(err))
    }

    pub fn is_no_hosts(&self) -> bool {
        matches!(self, ClientError::NoHosts(_))
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid registry configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown registry type: {0}")]
    UnknownRegistry(String),

    #[error("Registry client error: {0}")]
    Client(#[from] ClientError),

    #[error("Registry {0} is already started")]
    AlreadyStarted(String),

    #[error("Registry {0} is not running")]
    NotRunning(String),

    #[error("Registry {0} is already stopped")]
    AlreadyStopped(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),
}
