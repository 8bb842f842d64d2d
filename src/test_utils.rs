//! In-memory doubles for the pipeline's collaborators.

use crate::capture::RowsEvent;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::hub::{Message, Publisher};
use crate::position::Position;
use crate::source::{Handlers, ReplicationSource};
use crate::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Checkpoint store that keeps every write.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    saved: Mutex<Vec<Checkpoint>>,
    fail_writes: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts out as if `position` had been persisted by an earlier run.
    pub fn with_position(position: Position) -> Self {
        let store = Self::default();
        store.lock().push(Checkpoint::new(position));
        store
    }

    /// Positions in write order.
    pub fn written(&self) -> Vec<Position> {
        self.lock()
            .iter()
            .map(|checkpoint| checkpoint.position.clone())
            .collect()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Checkpoint>> {
        self.saved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.lock().last().cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence(io::Error::new(
                io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.lock().push(checkpoint.clone());
        Ok(())
    }
}

/// Publisher that records every accepted batch.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    batches: Mutex<Vec<Vec<Message>>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted batches, in publish order. Rejected batches are not kept.
    pub fn batches(&self) -> Vec<Vec<Message>> {
        self.lock().clone()
    }

    /// Total number of accepted messages.
    pub fn published(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<Message>>> {
        self.batches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, batch: Vec<Message>) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Publish(format!(
                "rejected batch of {} messages",
                batch.len()
            )));
        }
        self.lock().push(batch);
        Ok(())
    }
}

/// One scripted source action.
#[derive(Debug, Clone)]
pub enum Step {
    Rows(RowsEvent),
    Synced(Position),
    /// Stops the stream with [`Error::Replication`].
    Fail(String),
    /// Panics with the given message.
    Panic(String),
}

/// Source that plays a fixed script, then idles until cancelled.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: Mutex<Vec<Step>>,
    started_from: Mutex<Option<Option<Position>>>,
    cancelled: AtomicBool,
}

impl ScriptedSource {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script),
            ..Self::default()
        }
    }

    /// The start position the last `run` was given, if it ran at all.
    pub fn started_from(&self) -> Option<Option<Position>> {
        self.started_from
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether `run` ended because it observed cancellation.
    pub fn observed_cancellation(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicationSource for ScriptedSource {
    async fn run(
        &self,
        start: Option<Position>,
        handlers: Handlers,
        shutdown: CancellationToken,
    ) -> Result<()> {
        *self
            .started_from
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(start);

        let script = std::mem::take(
            &mut *self
                .script
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        for step in script {
            if shutdown.is_cancelled() {
                break;
            }
            match step {
                Step::Rows(rows) => handlers.row(rows).await?,
                Step::Synced(position) => handlers.position_synced(position).await?,
                Step::Fail(message) => return Err(Error::Replication { message }),
                Step::Panic(message) => panic!("{}", message),
            }
        }

        shutdown.cancelled().await;
        self.cancelled.store(true, Ordering::SeqCst);
        Err(Error::Shutdown)
    }
}
