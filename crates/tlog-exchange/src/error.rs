//! Error types for the exchange protocols.

use tlog_chain::ChainError;

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The peer is gone; no further frames can be sent.
    #[error("channel closed")]
    Closed,

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end an exchange.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Transport loss, a malformed or incomplete peer answer, or a protocol
    /// violation. Aborts the current exchange only.
    #[error("unexpected termination: {0}")]
    UnexpectedTermination(String),

    /// The peer's blocks failed verification and were discarded.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Chain(ChainError),
}

impl ExchangeError {
    pub(crate) fn terminated(reason: impl Into<String>) -> Self {
        ExchangeError::UnexpectedTermination(reason.into())
    }

    /// Whether retrying with the same peer later could succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExchangeError::UnexpectedTermination(_) | ExchangeError::Channel(_) => true,
            ExchangeError::Chain(e) => e.is_recoverable(),
            ExchangeError::VerificationFailed(_) | ExchangeError::Codec(_) => false,
        }
    }
}

impl From<ChainError> for ExchangeError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::VerificationFailed(reason) => ExchangeError::VerificationFailed(reason),
            other => ExchangeError::Chain(other),
        }
    }
}

impl From<postcard::Error> for ExchangeError {
    fn from(e: postcard::Error) -> Self {
        ExchangeError::Codec(e.to_string())
    }
}

/// Result type for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;
