//! Key material, pre-key agreement and the double ratchet.
//!
//! Everything here is synchronous and storage agnostic. The `connect-e2ee`
//! crate adds stores, a directory client and per-session locking on top.

pub mod bundle;
pub mod consts;
pub mod crypto;
pub mod curve;
pub mod device;
pub mod error;
pub mod identity;
pub mod keys;
pub mod prekey;
pub mod protocol;
pub mod ratchet;
pub mod session;
pub mod x3dh;

pub use bundle::{BundleValidator, FreshnessPolicy, ValidBundle};
pub use curve::{CurveError, KeyPair, PrivateKey, PublicKey, Signature};
pub use device::{DeviceAddress, User, UserStatus};
pub use error::{DecryptionFailure, ProtocolError};
pub use identity::{IdentityKey, IdentityKeyPair};
pub use prekey::{
    OneTimePreKey, OneTimePreKeyRecord, PreKeyBundle, PreKeyId, SignedPreKey, SignedPreKeyId,
    SignedPreKeyRecord,
};
pub use protocol::{EncryptedMessage, HandshakeMessage, MessageHeader};
pub use ratchet::RatchetEngine;
pub use session::{Session, SessionRecord};
pub use x3dh::{Tiebreak, accept_session, initiate_session, resolve_simultaneous};
