//! The broker operations the transport depends on.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Message bodies from one subscription. The stream ends or yields an error
/// once the underlying channel is unusable.
pub type Deliveries = BoxStream<'static, Result<Vec<u8>>>;

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Cancelled once the connection is lost.
    fn broken(&self) -> CancellationToken;

    async fn open_publisher(&self) -> Result<Box<dyn BrokerPublisher>>;

    /// Declare the fanout `exchange`, bind a private queue to it and consume it.
    async fn subscribe(&self, exchange: &str) -> Result<Deliveries>;
}

#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Cancelled once the publish channel is unusable.
    fn broken(&self) -> CancellationToken;

    async fn publish(&self, exchange: &str, payload: &[u8]) -> Result<()>;
}
