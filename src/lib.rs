pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hub;
pub mod position;
pub mod replicator;
pub mod source;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::Replicator;
