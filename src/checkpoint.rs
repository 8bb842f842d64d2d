//! Durable storage for the replication checkpoint.
//!
//! The checkpoint is the last binlog [`Position`] the pipeline acknowledged.
//! It is persisted as a single JSON document that every save fully
//! overwrites, so a restart can resume without re-reading the whole stream.
//!
//! # Example
//!
//! ```rust,no_run
//! use binlog_hub::checkpoint::{Checkpoint, CheckpointManager, CheckpointStore};
//! use binlog_hub::position::Position;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("checkpoint.json");
//!
//!     // Load existing checkpoint
//!     if let Some(checkpoint) = manager.load().await? {
//!         println!("Resuming from {}", checkpoint.position);
//!     }
//!
//!     // Save new checkpoint
//!     let checkpoint = Checkpoint::new(Position::new("mysql-bin.000003", 1547));
//!     manager.save(&checkpoint).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::position::Position;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// A persisted replication position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The last acknowledged binlog position
    pub position: Position,
    /// The time this checkpoint was created
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Creates a new checkpoint with the current timestamp.
    ///
    /// ```rust
    /// use binlog_hub::checkpoint::Checkpoint;
    /// use binlog_hub::position::Position;
    ///
    /// let checkpoint = Checkpoint::new(Position::new("mysql-bin.000001", 4));
    /// assert_eq!(checkpoint.position.pos, 4);
    /// ```
    pub fn new(position: Position) -> Self {
        Self {
            position,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Storage backend for checkpoints.
///
/// Each `save` replaces the previous checkpoint entirely; `load` returns
/// whatever the last successful `save` wrote.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the stored checkpoint, or `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<Checkpoint>>;

    /// Replaces the stored checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Manages checkpoint persistence to disk.
///
/// The `CheckpointManager` handles atomic writes to ensure that checkpoints
/// are never corrupted, even if the process crashes during a write operation.
///
/// ```rust,no_run
/// use binlog_hub::checkpoint::CheckpointManager;
///
/// let manager = CheckpointManager::for_position("/var/lib/binlog-hub", "primary");
/// assert!(manager.path().ends_with("primary.json"));
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    /// Creates a new checkpoint manager with the specified file path.
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    /// Checkpoint stored as `{directory}/{name}.json`.
    pub fn for_position(directory: impl AsRef<Path>, name: &str) -> Self {
        Self::new(directory.as_ref().join(format!("{}.json", name)))
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Deletes the checkpoint file if it exists.
    ///
    /// The next run then starts from the head of the current binlog file.
    pub async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.file_path).await {
            Ok(()) => {
                info!("Deleted checkpoint file {:?}", self.file_path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence(e)),
        }
    }
}

#[async_trait]
impl CheckpointStore for CheckpointManager {
    /// Reads the checkpoint through a fresh handle from the start of the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the file exists but cannot be read
    /// or does not contain a valid checkpoint.
    async fn load(&self) -> Result<Option<Checkpoint>> {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No checkpoint file found at {:?}", self.file_path);
                return Ok(None);
            }
            Err(e) => {
                error!("Failed to read checkpoint file: {}", e);
                return Err(Error::Persistence(e));
            }
        };

        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) => {
                info!(
                    "Loaded checkpoint: position={}, timestamp={}",
                    checkpoint.position, checkpoint.timestamp
                );
                Ok(Some(checkpoint))
            }
            Err(e) => {
                error!("Failed to parse checkpoint file: {}", e);
                Err(Error::Persistence(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("invalid checkpoint file {:?}: {}", self.file_path, e),
                )))
            }
        }
    }

    /// Saves checkpoint to disk atomically.
    ///
    /// 1. Writing to a temporary file
    /// 2. Syncing the file to ensure data is on disk
    /// 3. Atomically renaming the temp file to the final location
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!("Saving checkpoint: position={}", checkpoint.position);

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        debug!("Checkpoint saved successfully");
        Ok(())
    }
}
