//! Replication position tracking.
//!
//! The source reports every position it has fully handed over through
//! [`PositionTracker::save`]. A dedicated loop ([`PositionTracker::run`])
//! persists the latest one on a fixed tick, but only when it changed since
//! the last write.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How far into the binlog has been consumed.
///
/// Ordered by file name first, then offset. Binlog file names carry a
/// zero-padded sequence number, so lexical order is stream order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Pos")]
    pub pos: u32,
    /// GTID of the last transaction at or before this position, when the
    /// primary runs with GTIDs.
    #[serde(rename = "Gtid", default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
}

impl Position {
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
            gtid: None,
        }
    }

    pub fn with_gtid(mut self, gtid: impl Into<String>) -> Self {
        self.gtid = Some(gtid.into());
        self
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.pos)
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    last_seen: Option<Position>,
    dirty: bool,
}

/// Holds the latest acknowledged position and persists it when dirty.
pub struct PositionTracker {
    store: Arc<dyn CheckpointStore>,
    tick: Duration,
    state: Mutex<TrackerState>,
}

impl PositionTracker {
    pub fn new(store: Arc<dyn CheckpointStore>, tick: Duration) -> Self {
        Self {
            store,
            tick,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Records the latest position and marks it for persistence.
    ///
    /// Last write wins: an unsaved previous value is simply replaced.
    pub async fn save(&self, position: Position) {
        let mut state = self.state.lock().await;

        if let Some(previous) = &state.last_seen {
            if position < *previous {
                warn!(
                    "Position moved backwards from {} to {}",
                    previous, position
                );
            }
        }

        state.last_seen = Some(position);
        state.dirty = true;
    }

    /// The most recently persisted position, read back from the store.
    pub async fn get(&self) -> Result<Option<Position>> {
        Ok(self.store.load().await?.map(|checkpoint| checkpoint.position))
    }

    /// The latest saved position, persisted or not.
    pub async fn last_seen(&self) -> Option<Position> {
        self.state.lock().await.last_seen.clone()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Persists the current position if it changed since the last write.
    ///
    /// Returns whether a write happened. A `save` that lands while the
    /// write is in flight marks the state dirty again for the next tick.
    pub async fn tick(&self) -> Result<bool> {
        let position = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            match state.last_seen.clone() {
                Some(position) => position,
                None => return Ok(false),
            }
        };

        debug!(name = %position.name, pos = position.pos, "Persisting position");

        if let Err(e) = self.store.save(&Checkpoint::new(position)).await {
            error!("Failed to persist position: {}", e);
            self.state.lock().await.dirty = true;
            return Err(e);
        }

        Ok(true)
    }

    /// Persistence loop. Ends with the first write failure, or with
    /// [`Error::Shutdown`] once `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Position tracker started with tick {:?}", self.tick);

        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Position tracker stopping");
                    return Err(Error::Shutdown);
                }
                _ = ticker.tick() => {
                    self.tick().await?;
                }
            }
        }
    }
}
