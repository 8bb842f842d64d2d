use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// One serialized event ready for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Partition/routing key; messages sharing a key keep their order.
    pub key: Option<String>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(key: Option<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }
}

/// Downstream message bus.
///
/// A batch is accepted or rejected as a unit; callers never assume that
/// part of a failed batch was delivered.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, batch: Vec<Message>) -> Result<()>;
}
