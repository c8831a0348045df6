use thiserror::Error;

/// The application-level error type for Tern.
#[derive(Error, Debug)]
pub enum TernError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("XMPP error: {0}")]
    Xmpp(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Logging setup failed: {0}")]
    Telemetry(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for Tern operations.
pub type Result<T> = std::result::Result<T, TernError>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}
