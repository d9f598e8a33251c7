use thiserror::Error;

/// Errors raised by a [`LocalStore`](crate::outbox::LocalStore).
#[derive(Error, Debug)]
pub enum StorageError {
    /// The write would exceed the store's (or the outbox's) byte budget
    #[error("Storage quota exceeded writing '{key}' ({bytes} bytes)")]
    QuotaExceeded { key: String, bytes: usize },

    /// Underlying filesystem failure
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be decoded
    #[error("Corrupt entry under '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors that can occur in the realtime coordinator.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// WebSocket protocol error (connection failed, invalid frame, etc.)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Channel open/subscribe failure or lost socket
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication or authorization error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Channel-specific error reported by the server
    #[error("Channel error: {0}")]
    Channel(String),

    /// Malformed subscription descriptor. Programmer error, never retried.
    #[error("Invalid subscription descriptor: {0}")]
    InvalidDescriptor(String),

    /// Outgoing message rejected before it reached the outbox
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Remote write failed while online
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Local persistence failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error (PostgREST calls)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error (malformed endpoint URL)
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Operation timed out
    #[error("Timeout error")]
    Timeout,

    /// Attempted operation while not connected to the server
    #[error("Not connected")]
    NotConnected,
}

/// Convenience type alias for `Result<T, RealtimeError>`.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Error returned from subscriber callbacks. Isolated and logged by the router.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
