//! Replication sources: whatever produces raw rows events and the binlog
//! positions that follow them.

pub mod backoff;
#[cfg(feature = "mysql")]
pub mod mysql;

pub use backoff::{retry, Backoff};
#[cfg(feature = "mysql")]
pub use mysql::BinlogSource;

use crate::capture::RowsEvent;
use crate::position::Position;
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type RowHandler = Arc<dyn Fn(RowsEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type PositionHandler = Arc<dyn Fn(Position) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Callbacks a source invokes while streaming.
///
/// Both default to no-ops and are set independently.
#[derive(Clone)]
pub struct Handlers {
    on_row: RowHandler,
    on_position_synced: PositionHandler,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            on_row: Arc::new(|_| Box::pin(async { Ok(()) })),
            on_position_synced: Arc::new(|_| Box::pin(async { Ok(()) })),
        }
    }
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per rows event, in stream order.
    pub fn with_on_row<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(RowsEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_row = Arc::new(move |event| Box::pin(handler(event)));
        self
    }

    /// Called with every position up to which all rows have been handed
    /// to `on_row`.
    pub fn with_on_position_synced<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Position) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_position_synced = Arc::new(move |position| Box::pin(handler(position)));
        self
    }

    pub async fn row(&self, event: RowsEvent) -> Result<()> {
        (self.on_row)(event).await
    }

    pub async fn position_synced(&self, position: Position) -> Result<()> {
        (self.on_position_synced)(position).await
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

/// A stream of row changes that can resume from a [`Position`].
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Streams from `start` (or from the source's own default when `None`)
    /// until `shutdown` is cancelled or something fails.
    ///
    /// Returns [`Error::Shutdown`](crate::Error::Shutdown) when cancelled.
    /// Handler errors stop the stream and are returned unchanged.
    async fn run(
        &self,
        start: Option<Position>,
        handlers: Handlers,
        shutdown: CancellationToken,
    ) -> Result<()>;
}
