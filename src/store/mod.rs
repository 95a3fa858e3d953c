pub mod error;
pub mod filestore;
pub mod memory;
pub mod traits;

pub use error::StoreError;
pub use filestore::FileStore;
pub use memory::InMemoryBackend;
pub use traits::Backend;

/// Storage keys used by this crate.
pub(crate) mod keys {
    use e2ecore::DeviceAddress;

    pub const IDENTITY: &str = "identity";
    pub const PRE_KEYS: &str = "prekeys";
    pub const SESSION_PREFIX: &str = "session:";

    pub fn session(address: &DeviceAddress) -> String {
        format!("{SESSION_PREFIX}{address}")
    }
}
