//! Error types for the attach-dl library.

use thiserror::Error;

/// Errors that can occur while running a download job.
#[derive(Error, Debug)]
pub enum Error {
    /// The job configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Archive writer failed.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The host table rejected a request.
    #[error("host table error: {0}")]
    Table(String),

    /// The agent connection failed, closed unexpectedly, or reported a
    /// job-level error.
    #[error("agent connection error: {0}")]
    WebSocket(String),

    /// A message was about to be sent out of protocol order.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The agent is older than the minimum version the job needs.
    #[error("agent version {found} is older than required {required}")]
    AgentVersion {
        /// Version reported by the agent.
        found: String,
        /// Minimum version configured for the job.
        required: String,
    },

    /// The job was cancelled.
    #[error("job cancelled")]
    Cancelled,
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl Error {
    /// Returns true for errors that end the whole job rather than one file.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_) | Self::Protocol(_) | Self::AgentVersion { .. }
        )
    }
}

/// A specialized `Result` type for attach-dl operations.
pub type Result<T> = std::result::Result<T, Error>;
