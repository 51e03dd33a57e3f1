use thiserror::Error;

/// Session store errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport or connection failure reported by a document store adapter
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Duplicate key on index {index}: {key}")]
    DuplicateKey { index: String, key: String },

    /// An attribute value could not be represented in a document
    #[error("Encoding Error: {0}")]
    Encoding(String),

    /// A stored value could not be turned back into an attribute
    #[error("Decoding Error: {0}")]
    Decoding(String),

    /// Configuration was invalid, or changed while a component was running
    #[error("Configuration Error: {0}")]
    Config(String),

    /// The session was invalidated and can no longer be used
    #[error("Session invalidated: {0}")]
    Invalidated(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

impl SessionError {
    /// Whether the failure came from the store transport rather than from the data itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::StoreUnavailable(_))
    }
}

/// Result type for session store operations
pub type SessionResult<T> = Result<T, SessionError>;
