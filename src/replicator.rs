//! Wires a replication source to the batching publisher and the position
//! tracker, and runs them as one fail-fast group.

use crate::capture::TableFilter;
use crate::checkpoint::CheckpointStore;
use crate::config::{Config, PublishingConfig};
use crate::hub::{BatchPublisher, Publisher};
use crate::position::PositionTracker;
use crate::source::{Handlers, ReplicationSource};
use crate::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Replicator {
    filter: Arc<TableFilter>,
    publishing: PublishingConfig,
    position_interval: Duration,
    source: Arc<dyn ReplicationSource>,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn CheckpointStore>,
}

impl Replicator {
    pub fn new(
        config: &Config,
        source: Arc<dyn ReplicationSource>,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            filter: Arc::new(TableFilter::from_names(config.allowed_tables())),
            publishing: config.connection.eventhub.publishing.clone(),
            position_interval: config.binlog_reader.position.interval,
            source,
            publisher,
            store,
        }
    }

    /// Runs until `shutdown` is cancelled or any component fails.
    ///
    /// The first error wins: it cancels every other component, all of them
    /// are awaited, and that error is returned. External cancellation ends
    /// in [`Error::Shutdown`] after one last flush of buffered events and one
    /// last checkpoint write.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let token = shutdown.child_token();
        let tracker = Arc::new(PositionTracker::new(
            self.store.clone(),
            self.position_interval,
        ));
        let batcher = BatchPublisher::with_tracker(
            self.publisher.clone(),
            &self.publishing,
            token.clone(),
            tracker.clone(),
        );

        let start = tracker.get().await?;
        match &start {
            Some(position) => info!("Resuming from saved position {}", position),
            None => info!("No saved position, starting at the current binlog file"),
        }

        info!(
            tables = self.filter.len(),
            max_events = self.publishing.max_events,
            interval = ?self.publishing.interval,
            "Replicator started"
        );

        let handlers = Handlers::new()
            .with_on_row({
                let filter = self.filter.clone();
                let batcher = batcher.clone();
                move |rows| {
                    let filter = filter.clone();
                    let batcher = batcher.clone();
                    async move {
                        for event in filter.events(&rows) {
                            batcher.append(event).await?;
                        }
                        Ok(())
                    }
                }
            })
            .with_on_position_synced({
                let batcher = batcher.clone();
                move |position| {
                    let batcher = batcher.clone();
                    async move {
                        batcher.sync_position(position).await;
                        Ok(())
                    }
                }
            });

        let mut tasks = Tasks::default();

        tasks.spawn("source", {
            let source = self.source.clone();
            let token = token.clone();
            async move { source.run(start, handlers, token).await }
        });
        tasks.spawn("position tracker", {
            let tracker = tracker.clone();
            let token = token.clone();
            async move { tracker.run(token).await }
        });
        tasks.spawn("flush timers", {
            let batcher = batcher.clone();
            let token = token.clone();
            async move { batcher.run(token).await }
        });
        tasks.spawn("shutdown watcher", {
            let token = token.clone();
            async move {
                token.cancelled().await;
                Err(Error::Shutdown)
            }
        });

        let mut first: Option<Error> = None;

        while let Some((name, result)) = tasks.join_next().await {
            match result {
                Ok(()) => debug!("{} finished", name),
                Err(e) => {
                    if first.is_none() {
                        if e.is_shutdown() {
                            debug!("{} observed shutdown", name);
                        } else {
                            error!("{} failed: {}", name, e);
                        }
                        first = Some(e);
                        token.cancel();
                    } else {
                        debug!("{} stopped: {}", name, e);
                    }
                }
            }
        }

        if shutdown.is_cancelled() {
            drain(&batcher, &tracker).await;
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Named pipeline tasks. Names survive panics through the task id.
#[derive(Default)]
struct Tasks {
    set: JoinSet<(&'static str, Result<()>)>,
    names: HashMap<Id, &'static str>,
}

impl Tasks {
    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.set.spawn(async move { (name, task.await) });
        self.names.insert(handle.id(), name);
    }

    async fn join_next(&mut self) -> Option<(&'static str, Result<()>)> {
        let joined = self.set.join_next().await?;
        Some(match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                let name = self.names.get(&e.id()).copied().unwrap_or("unnamed task");
                (
                    name,
                    Err(Error::Internal(format!("{} panicked: {}", name, e))),
                )
            }
        })
    }
}

/// Publishes what is still buffered, then persists the latest position.
/// The position is only written when everything before it went out.
async fn drain(batcher: &BatchPublisher, tracker: &PositionTracker) {
    let pending = batcher.pending().await;
    if pending > 0 {
        info!("Flushing {} buffered events before exit", pending);
    }

    if let Err(e) = batcher.flush().await {
        warn!("Final flush failed, keeping the previous checkpoint: {}", e);
        return;
    }

    match tracker.tick().await {
        Ok(true) => info!("Final position persisted"),
        Ok(false) => {}
        Err(e) => warn!("Final position write failed: {}", e),
    }
}
