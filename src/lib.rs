pub use e2ecore;

pub mod client;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod identity;
pub mod prekeys;
pub mod session_store;
pub mod store;

pub use client::{Client, ClientBuilder, EstablishedSession, MaintenanceReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClientConfig;
pub use directory::{Directory, DirectoryClient, DirectoryError, MemoryDirectory};
pub use e2ecore::DeviceAddress;
pub use error::{E2eeError, Result};
