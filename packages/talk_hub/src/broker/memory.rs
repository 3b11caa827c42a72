//! In-process fanout broker.
//!
//! Behaves like a set of fanout exchanges: every live subscription on an
//! exchange receives its own copy of each publish, and publishes to an
//! exchange without subscribers vanish. Each [`MemoryConnector`] can be taken
//! offline or have its connections broken, which is how transports are driven
//! through reconnects in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connector::{BrokerConnection, BrokerConnector, BrokerPublisher, Deliveries};
use crate::error::{HubError, Result};

struct Subscriber {
    connection: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct Exchanges {
    by_name: HashMap<String, Vec<Subscriber>>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    exchanges: Arc<Mutex<Exchanges>>,
    next_connection: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Exchanges> {
        self.exchanges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connector with its own online switch.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            online: Arc::new(AtomicBool::new(true)),
            live: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Live subscriptions bound to `exchange`.
    pub fn subscriber_count(&self, exchange: &str) -> usize {
        self.lock()
            .by_name
            .get(exchange)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn bind(&self, exchange: &str, connection: u64) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .by_name
            .entry(exchange.to_string())
            .or_default()
            .push(Subscriber { connection, tx });
        rx
    }

    fn fanout(&self, exchange: &str, payload: &[u8]) {
        let mut exchanges = self.lock();
        let Some(subs) = exchanges.by_name.get_mut(exchange) else {
            debug!(exchange = %exchange, "publish to exchange without subscribers");
            return;
        };
        subs.retain(|s| s.tx.send(payload.to_vec()).is_ok());
        if subs.is_empty() {
            // auto-delete
            exchanges.by_name.remove(exchange);
        }
    }

    fn drop_connection(&self, connection: u64) {
        let mut exchanges = self.lock();
        for subs in exchanges.by_name.values_mut() {
            subs.retain(|s| s.connection != connection);
        }
        exchanges.by_name.retain(|_, subs| !subs.is_empty());
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    online: Arc<AtomicBool>,
    live: Arc<Mutex<Vec<(u64, CancellationToken)>>>,
}

impl MemoryConnector {
    /// While offline every dial fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Break every connection this connector handed out, as a network
    /// failure would.
    pub fn break_connections(&self) {
        let live = std::mem::take(&mut *self.live.lock().unwrap_or_else(PoisonError::into_inner));
        for (id, token) in live {
            token.cancel();
            self.broker.drop_connection(id);
        }
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(HubError::TransportBroken("broker unreachable".to_string()));
        }
        let id = self.broker.next_connection.fetch_add(1, Ordering::Relaxed);
        let broken = CancellationToken::new();
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, broken.clone()));
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
            broken,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    broken: CancellationToken,
}

impl MemoryConnection {
    fn check(&self) -> Result<()> {
        if self.broken.is_cancelled() {
            return Err(HubError::TransportBroken("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn broken(&self) -> CancellationToken {
        self.broken.clone()
    }

    async fn open_publisher(&self) -> Result<Box<dyn BrokerPublisher>> {
        self.check()?;
        Ok(Box::new(MemoryPublisher {
            broker: self.broker.clone(),
            broken: self.broken.child_token(),
        }))
    }

    async fn subscribe(&self, exchange: &str) -> Result<Deliveries> {
        self.check()?;
        let rx = self.broker.bind(exchange, self.id);
        let broken = self.broken.clone();
        let deliveries = futures::stream::unfold((rx, broken), |(mut rx, broken)| async move {
            let next = tokio::select! {
                _ = broken.cancelled() => None,
                body = rx.recv() => body,
            };
            next.map(|body| (Ok::<_, HubError>(body), (rx, broken)))
        });
        Ok(Box::pin(deliveries))
    }
}

struct MemoryPublisher {
    broker: MemoryBroker,
    broken: CancellationToken,
}

#[async_trait]
impl BrokerPublisher for MemoryPublisher {
    fn broken(&self) -> CancellationToken {
        self.broken.clone()
    }

    async fn publish(&self, exchange: &str, payload: &[u8]) -> Result<()> {
        if self.broken.is_cancelled() {
            return Err(HubError::TransportBroken("channel closed".to_string()));
        }
        self.broker.fanout(exchange, payload);
        Ok(())
    }
}
