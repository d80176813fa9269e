pub mod config;
pub mod datastore;
pub mod error;
pub mod fileio;
pub mod flock;
pub mod scheduler;

pub use config::DataStoreConfig;
pub use datastore::{DataStore, DataStoreInfo, DataStoreSizes, DataStores, Guid};
pub use error::{Error, Result};
