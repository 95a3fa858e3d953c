use e2ecore::ProtocolError;
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, E2eeError>;

#[derive(Debug, Error)]
pub enum E2eeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("no signed pre-key available, run provisioning or maintenance first")]
    NoSignedPreKey,
    #[error("pre-key id space exhausted, reregister the device")]
    PreKeyIdsExhausted,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl E2eeError {
    /// Transient directory failure; the caller may try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Directory(DirectoryError::Unavailable(_) | DirectoryError::Timeout(_))
        )
    }

    /// Re-fetching a bundle or resending the message can recover.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Protocol(e) if e.is_recoverable())
    }

    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}
