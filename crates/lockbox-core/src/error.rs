use thiserror::Error;

pub type LockboxResult<T> = Result<T, LockboxError>;

#[derive(Debug, Error)]
pub enum LockboxError {
    /// User key missing, or the wrapped key could not be opened with the master key.
    #[error("key resolution failed: {0}")]
    KeyResolution(String),

    /// AEAD tag mismatch on a block (tampering, wrong key, or truncation).
    #[error("block authentication failed")]
    Authentication,

    #[error("malformed cipher stream: {0}")]
    Framing(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse failure signal handed to the RPC layer.
///
/// Ownership failures collapse into `NotFound` so a caller cannot probe for
/// files belonging to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    NotFound,
    Cancelled,
    InvalidArgument,
    Internal,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NotFound => "file not found",
            Self::Cancelled => "request cancelled",
            Self::InvalidArgument => "invalid request",
            Self::Internal => "internal error",
        };
        f.write_str(msg)
    }
}

impl LockboxError {
    pub fn client_error(&self) -> ClientError {
        match self {
            Self::NotFound(_) | Self::PermissionDenied(_) => ClientError::NotFound,
            Self::Cancelled => ClientError::Cancelled,
            Self::InvalidInput(_) => ClientError::InvalidArgument,
            _ => ClientError::Internal,
        }
    }

    pub fn storage(e: impl std::fmt::Display) -> Self {
        Self::Storage(e.to_string())
    }
}
