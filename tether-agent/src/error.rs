//! Error types for the device agent.

/// Alias for `Result<T, tether_agent::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while configuring or running the server.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The listen address did not resolve to any socket address.
    #[error("listen address {0:?} did not resolve")]
    Resolve(String),

    /// A message could not be encoded.
    #[error(transparent)]
    Proto(#[from] tether_proto::Error),

    /// An I/O error from the reactor, listener or worker runtime.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
