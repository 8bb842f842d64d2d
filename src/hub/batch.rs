//! Event batching in front of the [`Publisher`].
//!
//! Events are buffered in append order and flushed as one batch when either
//! the buffer reaches `max_events` or the timer armed by the first buffered
//! event fires, whichever comes first.
//!
//! Every flush bumps the buffer epoch. A timer only flushes the epoch it was
//! armed for, so a timer that outlives a size-triggered flush finds nothing
//! to do instead of flushing the next batch early.
//!
//! Binlog positions synced while events are buffered are held with those
//! events and only reach the [`PositionTracker`] once the batch holding them
//! was published. A failed batch discards its position along with its
//! events, so the checkpoint never moves past unpublished rows.

use super::publisher::Publisher;
use super::serializer::JsonSerializer;
use crate::capture::Event;
use crate::config::PublishingConfig;
use crate::position::{Position, PositionTracker};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

#[derive(Debug, Default)]
struct Buffer {
    events: Vec<Event>,
    epoch: u64,
    /// Latest position synced after the buffered events.
    synced: Option<Position>,
}

struct Inner {
    publisher: Arc<dyn Publisher>,
    max_events: usize,
    interval: Duration,
    shutdown: CancellationToken,
    tracker: Option<Arc<PositionTracker>>,
    buffer: Mutex<Buffer>,
    failures: mpsc::Sender<Error>,
    failure_rx: Mutex<Option<mpsc::Receiver<Error>>>,
}

/// Ordered event buffer with size- and time-triggered flushes.
///
/// Cheap to clone; clones share the same buffer.
#[derive(Clone)]
pub struct BatchPublisher {
    inner: Arc<Inner>,
}

impl BatchPublisher {
    /// `shutdown` disarms every pending flush timer once cancelled.
    pub fn new(
        publisher: Arc<dyn Publisher>,
        config: &PublishingConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self::build(publisher, config, shutdown, None)
    }

    /// Like [`new`](Self::new), handing positions from
    /// [`sync_position`](Self::sync_position) to `tracker` once everything
    /// buffered before them was published.
    pub fn with_tracker(
        publisher: Arc<dyn Publisher>,
        config: &PublishingConfig,
        shutdown: CancellationToken,
        tracker: Arc<PositionTracker>,
    ) -> Self {
        Self::build(publisher, config, shutdown, Some(tracker))
    }

    fn build(
        publisher: Arc<dyn Publisher>,
        config: &PublishingConfig,
        shutdown: CancellationToken,
        tracker: Option<Arc<PositionTracker>>,
    ) -> Self {
        let (failures, failure_rx) = mpsc::channel(1);

        Self {
            inner: Arc::new(Inner {
                publisher,
                max_events: config.max_events.max(1),
                interval: config.interval,
                shutdown,
                tracker,
                buffer: Mutex::new(Buffer {
                    events: Vec::with_capacity(config.max_events),
                    epoch: 0,
                    synced: None,
                }),
                failures,
                failure_rx: Mutex::new(Some(failure_rx)),
            }),
        }
    }

    /// Buffers `event`, flushing synchronously once the buffer holds
    /// `max_events`. The first event of an empty buffer arms the flush timer.
    ///
    /// Fails only when the flush it triggered fails.
    pub async fn append(&self, event: Event) -> Result<()> {
        trace!(
            "Appending {} on {}.{}",
            event.action,
            event.database,
            event.table
        );

        let mut buffer = self.inner.buffer.lock().await;
        buffer.events.push(event);

        if buffer.events.len() >= self.inner.max_events {
            return self.inner.flush_locked(&mut buffer).await;
        }

        if buffer.events.len() == 1 {
            self.arm_timer(buffer.epoch);
        }

        Ok(())
    }

    /// Publishes everything buffered. The buffer is cleared even when
    /// publishing fails; those events are not retried.
    pub async fn flush(&self) -> Result<()> {
        let mut buffer = self.inner.buffer.lock().await;
        self.inner.flush_locked(&mut buffer).await
    }

    /// Records that the source is synced up to `position`.
    ///
    /// With nothing buffered the position goes to the tracker right away.
    /// Otherwise it waits for the flush of the current epoch and replaces
    /// any position already waiting there.
    pub async fn sync_position(&self, position: Position) {
        let Some(tracker) = &self.inner.tracker else {
            return;
        };

        let mut buffer = self.inner.buffer.lock().await;
        if buffer.events.is_empty() {
            tracker.save(position).await;
        } else {
            trace!(
                "Holding position {} until epoch {} is flushed",
                position,
                buffer.epoch
            );
            buffer.synced = Some(position);
        }
    }

    /// Number of buffered events.
    pub async fn pending(&self) -> usize {
        self.inner.buffer.lock().await.events.len()
    }

    /// Resolves with the first error of a timer-triggered flush, or with
    /// [`Error::Shutdown`] once `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let Some(mut failures) = self.inner.failure_rx.lock().await.take() else {
            return Err(Error::Internal(
                "batch publisher failures are already being watched".into(),
            ));
        };

        tokio::select! {
            biased;
            failure = failures.recv() => Err(failure.unwrap_or(Error::Shutdown)),
            _ = shutdown.cancelled() => Err(Error::Shutdown),
        }
    }

    fn arm_timer(&self, epoch: u64) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => {
                    trace!("Flush timer for epoch {} disarmed", epoch);
                }
                _ = tokio::time::sleep(inner.interval) => {
                    if let Err(e) = inner.flush_epoch(epoch).await {
                        error!("Timed flush failed: {}", e);
                        // Only the first failure matters; the pipeline is stopping.
                        let _ = inner.failures.try_send(e);
                    }
                }
            }
        });
    }
}

impl Inner {
    async fn flush_epoch(&self, epoch: u64) -> Result<()> {
        let mut buffer = self.buffer.lock().await;

        if buffer.epoch != epoch || buffer.events.is_empty() {
            trace!(
                "Flush timer for epoch {} is stale (current {})",
                epoch,
                buffer.epoch
            );
            return Ok(());
        }

        self.flush_locked(&mut buffer).await
    }

    async fn flush_locked(&self, buffer: &mut Buffer) -> Result<()> {
        if buffer.events.is_empty() {
            return Ok(());
        }

        let events = std::mem::take(&mut buffer.events);
        let synced = buffer.synced.take();
        buffer.epoch += 1;

        let messages = events
            .iter()
            .map(JsonSerializer::to_message)
            .collect::<Result<Vec<_>>>()?;

        let length = messages.len();
        let start = Instant::now();
        debug!("Flushing {} events (epoch {})", length, buffer.epoch);

        self.publisher.publish(messages).await?;

        info!(length, took = ?start.elapsed(), "flush");

        if let (Some(tracker), Some(position)) = (&self.tracker, synced) {
            tracker.save(position).await;
        }
        Ok(())
    }
}
