pub mod config;
pub mod error;
pub mod profile;
pub mod synchronizer;

pub use config::SyncConfig;
pub use error::SyncError;
pub use profile::ProfileLookup;
pub use synchronizer::Synchronizer;
