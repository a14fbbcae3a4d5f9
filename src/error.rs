use thiserror::Error;

/// Crate-wide error type for startup and configuration failures.
///
/// Per-frame and per-datagram problems are handled locally where they occur
/// and never surface through this type.
#[derive(Debug, Error)]
pub enum ReflectorError {
    /// Input parameters failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Failure while binding or using a socket.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    /// The configuration file could not be parsed.
    #[error("configuration file error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
