//! Error types and result handling for binlog-hub.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Every variant is fatal to the pipeline: components never recover from
//! their own errors, they surface them to the [`Replicator`](crate::Replicator)
//! which cancels the remaining tasks and returns the first error it saw.
//!
//! # Example
//!
//! ```rust
//! use binlog_hub::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for binlog-hub operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing configuration. Raised before any component runs.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The replication source is unreachable or rejected authentication.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An event could not be encoded for transport.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The message bus rejected a batch or could not accept it.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Kafka client error from the Event Hubs producer.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// The checkpoint could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// Replication stream failure after the connection was established.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// A pipeline task panicked or broke an internal contract.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Shutdown was requested (e.g., via Ctrl+C) or a sibling task failed.
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit the replication loops.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Process exit code for this error category.
    ///
    /// Codes follow `sysexits.h` so supervisors can tell a bad config
    /// apart from an unreachable database or a failing bus.
    ///
    /// ```rust
    /// use binlog_hub::Error;
    ///
    /// assert_eq!(Error::Config("missing".into()).exit_code(), 78);
    /// assert_eq!(Error::Shutdown.exit_code(), 0);
    /// ```
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Shutdown => 0,
            Error::Serialization(_) => 65,
            Error::Connection(_) => 69,
            Error::Internal(_) => 70,
            Error::Persistence(_) => 74,
            Error::Publish(_) | Error::Kafka(_) => 75,
            Error::Replication { .. } => 76,
            Error::Config(_) => 78,
        }
    }

    /// Whether this error only reports cancellation.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}

/// A convenient Result type alias for binlog-hub operations.
///
/// This is equivalent to `std::result::Result<T, binlog_hub::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
