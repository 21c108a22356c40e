//! Error types for the host client.

/// Alias for `Result<T, tether::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by [`Client`](crate::Client) operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The command ran but reported an error.
    #[error("command failed: {error}")]
    Command {
        /// Output produced before the failure.
        output: Vec<u8>,
        /// Error string reported by the device.
        error: String,
    },

    /// A file operation failed on the device.
    #[error("{path}: {error}")]
    Remote {
        /// Remote path.
        path: String,
        /// Error string reported by the device.
        error: String,
    },

    /// The device sent a message that does not fit the exchange.
    #[error("unexpected {0} from device")]
    Unexpected(String),

    /// Framing or decoding failure.
    #[error(transparent)]
    Proto(#[from] tether_proto::Error),

    /// An I/O error on the connection or a local file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
