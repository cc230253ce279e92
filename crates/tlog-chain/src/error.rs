//! Error types for the block repository and its collaborators.

use crate::hash::Hash;

/// Errors raised by the credential store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// No identity is registered under this id.
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    /// The supplied password does not unlock the identity.
    #[error("wrong password for {0}")]
    WrongPassword(String),

    /// Key material could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Errors raised by repository operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// A requested block is not stored locally.
    #[error("block not found: {0}")]
    NotFound(Hash),

    /// No genesis block has been installed yet.
    #[error("repository has not been bootstrapped")]
    NotBootstrapped,

    /// A genesis block is already installed.
    #[error("repository is already bootstrapped")]
    AlreadyBootstrapped,

    /// The signer may not write to the log.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A candidate batch failed signature, certificate or ancestry checks.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The blob store failed or holds inconsistent data.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl ChainError {
    /// Whether the caller can recover by fetching more data or retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChainError::NotFound(_) | ChainError::NotBootstrapped)
    }
}

impl From<postcard::Error> for ChainError {
    fn from(e: postcard::Error) -> Self {
        ChainError::Serialization(e.to_string())
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, ChainError>;
