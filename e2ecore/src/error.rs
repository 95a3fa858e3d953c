use thiserror::Error;

use crate::crypto::CryptoError;
use crate::curve::CurveError;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptionFailure {
    #[error("message key {counter} already used or evicted")]
    DuplicateOrEvicted { counter: u32 },
    #[error("counter jump of {jump} exceeds the limit of {limit}")]
    TooFarInFuture { jump: u32, limit: u32 },
    #[error("counter 0 is never issued")]
    ZeroCounter,
    #[error("authentication failed")]
    Authentication,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid signature detected")]
    InvalidSignature,
    #[error("signed pre-key {key_id} is expired or not yet valid (created at {created_at})")]
    Expired { key_id: u32, created_at: i64 },
    #[error("unknown pre-key id {0}")]
    UnknownPreKeyId(u32),
    #[error("unknown signed pre-key id {0}")]
    UnknownSignedPreKeyId(u32),
    #[error("decryption failed: {0}")]
    DecryptionFailure(#[from] DecryptionFailure),
    #[error("no identity has been provisioned")]
    IdentityUnavailable,
    #[error("no session established")]
    SessionNotEstablished,
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error(transparent)]
    Curve(#[from] CurveError),
}

impl ProtocolError {
    /// The caller can recover by re-fetching a bundle or resending.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownPreKeyId(_) | Self::UnknownSignedPreKeyId(_) | Self::DecryptionFailure(_)
        )
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidKeySize => Self::InvalidMessage("invalid key size"),
            CryptoError::InvalidTag => Self::DecryptionFailure(DecryptionFailure::Authentication),
        }
    }
}

impl From<bincode::error::EncodeError> for ProtocolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Encoding(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ProtocolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Encoding(e.to_string())
    }
}
