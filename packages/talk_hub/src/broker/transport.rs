//! Broker transport
//!
//! Owns one physical broker connection and everything multiplexed over it:
//!
//! - a dial task that (re)establishes the connection,
//! - a main task that owns the publish channel, buffers envelopes while no
//!   channel is usable, and starts/stops per-channel subscriptions,
//! - one task per tracked channel that subscribes, dispatches deliveries to
//!   the registered observer and resubscribes after channel failures.
//!
//! Timers run at `retry_interval` while something is missing and relax to
//! `check_interval` once it is healthy; broken signals reset them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connector::{BrokerConnection, BrokerConnector, BrokerPublisher, Deliveries};
use super::envelope::{
    CATCH_ALL_CHANNEL, CUSTOMER_CHANNEL, Envelope, EnvelopePayload, SERVICER_CHANNEL, exchange_name,
};
use crate::distribution::Observers;
use crate::error::{HubError, Result};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_SEND_QUEUE: usize = 100;
pub const DEFAULT_TRACK_QUEUE: usize = 100;

/// Which registry this transport feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Customer,
    Servicer,
}

impl Role {
    pub fn broadcast_channel(self) -> &'static str {
        match self {
            Self::Customer => CUSTOMER_CHANNEL,
            Self::Servicer => SERVICER_CHANNEL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Dialing,
    Connected,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub retry_interval: Duration,
    pub check_interval: Duration,
    pub send_queue: usize,
    pub track_queue: usize,
    /// Route every talk through the catch-all channel instead of one
    /// exchange per talk.
    pub shared_channel: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
            send_queue: DEFAULT_SEND_QUEUE,
            track_queue: DEFAULT_TRACK_QUEUE,
            shared_channel: false,
        }
    }
}

type ConnectionSlot = Option<Arc<dyn BrokerConnection>>;

enum TrackCommand {
    Start(String),
    Stop(String),
}

struct TrackStopped {
    channel: String,
    generation: u64,
}

struct TrackEntry {
    cancel: CancellationToken,
    generation: u64,
}

/// Handle to a running transport. Dropping it does not stop the tasks; cancel
/// the token passed to [`BrokerTransport::start`].
pub struct BrokerTransport {
    role: Role,
    shared_channel: bool,
    send_tx: mpsc::Sender<Envelope>,
    track_tx: mpsc::Sender<TrackCommand>,
    link: watch::Receiver<LinkState>,
    observers: Arc<Observers>,
}

impl BrokerTransport {
    pub fn start(
        connector: Arc<dyn BrokerConnector>,
        role: Role,
        options: TransportOptions,
        cancel: CancellationToken,
    ) -> Self {
        let observers = Arc::new(Observers::default());
        let (conn_tx, conn_rx) = watch::channel::<ConnectionSlot>(None);
        let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
        let (send_tx, send_rx) = mpsc::channel(options.send_queue.max(1));
        let (track_tx, track_rx) = mpsc::channel(options.track_queue.max(1));
        let (stopped_tx, stopped_rx) = mpsc::channel(options.track_queue.max(1));

        tokio::spawn(dial_loop(
            connector,
            conn_tx,
            link_tx,
            options.clone(),
            cancel.clone(),
        ));

        let main = MainLoop {
            role,
            options: options.clone(),
            observers: observers.clone(),
            conn_rx,
            send_rx,
            track_rx,
            stopped_tx,
            stopped_rx,
            tracks: HashMap::new(),
            next_generation: 0,
            publisher: None,
            pending: Vec::new(),
            cancel,
        };
        tokio::spawn(main.run());

        Self {
            role,
            shared_channel: options.shared_channel,
            send_tx,
            track_tx,
            link: link_rx,
            observers,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn shared_channel(&self) -> bool {
        self.shared_channel
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    /// Subscribe to the talk's channel. A no-op in shared-channel mode, where
    /// the catch-all subscription already carries every talk.
    pub fn add_track(&self, talk_id: &str) -> Result<()> {
        if talk_id.is_empty() {
            return Err(HubError::InvalidArgument("talk_id"));
        }
        if self.shared_channel {
            return Ok(());
        }
        self.track_tx
            .try_send(TrackCommand::Start(talk_id.to_string()))
            .map_err(|_| HubError::Canceled)
    }

    pub fn remove_track(&self, talk_id: &str) {
        if talk_id.is_empty() || self.shared_channel {
            return;
        }
        if self
            .track_tx
            .try_send(TrackCommand::Stop(talk_id.to_string()))
            .is_err()
        {
            warn!(talk_id = %talk_id, "track queue full, untrack dropped");
        }
    }

    /// Queue an envelope for publishing. Buffered while the broker is away.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.send_tx.try_send(envelope).map_err(|_| HubError::Canceled)
    }
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn dial_loop(
    connector: Arc<dyn BrokerConnector>,
    conn_tx: watch::Sender<ConnectionSlot>,
    link_tx: watch::Sender<LinkState>,
    options: TransportOptions,
    cancel: CancellationToken,
) {
    let mut next_dial = Instant::now();
    let mut broken: Option<CancellationToken> = None;
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wait_cancelled(broken.as_ref()) => {
                error!("broker connection broken");
                broken = None;
                conn_tx.send_replace(None);
                link_tx.send_replace(LinkState::Disconnected);
                next_dial = Instant::now() + options.retry_interval;
            }
            _ = sleep_until(next_dial) => {
                if broken.is_some() {
                    next_dial = Instant::now() + options.check_interval;
                    continue;
                }
                attempt += 1;
                link_tx.send_replace(LinkState::Dialing);
                match connector.connect().await {
                    Ok(conn) => {
                        info!(attempt = attempt, "broker connected");
                        attempt = 0;
                        broken = Some(conn.broken());
                        conn_tx.send_replace(Some(conn));
                        link_tx.send_replace(LinkState::Connected);
                        next_dial = Instant::now() + options.check_interval;
                    }
                    Err(e) => {
                        warn!(attempt = attempt, error = %e, "broker dial failed");
                        link_tx.send_replace(LinkState::Disconnected);
                        next_dial = Instant::now() + options.retry_interval;
                    }
                }
            }
        }
    }

    conn_tx.send_replace(None);
    link_tx.send_replace(LinkState::Disconnected);
    debug!("broker dial loop stopped");
}

struct MainLoop {
    role: Role,
    options: TransportOptions,
    observers: Arc<Observers>,
    conn_rx: watch::Receiver<ConnectionSlot>,
    send_rx: mpsc::Receiver<Envelope>,
    track_rx: mpsc::Receiver<TrackCommand>,
    stopped_tx: mpsc::Sender<TrackStopped>,
    stopped_rx: mpsc::Receiver<TrackStopped>,
    tracks: HashMap<String, TrackEntry>,
    next_generation: u64,
    publisher: Option<Box<dyn BrokerPublisher>>,
    /// Envelopes waiting for a publish channel, oldest first.
    pending: Vec<Envelope>,
    cancel: CancellationToken,
}

impl MainLoop {
    async fn run(mut self) {
        // Well-known channels live as long as the transport.
        for channel in [CATCH_ALL_CHANNEL, self.role.broadcast_channel()] {
            self.start_track(channel.to_string());
        }

        let mut next_check = Instant::now();
        loop {
            let publisher_broken = self.publisher.as_ref().map(|p| p.broken());
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = self.conn_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if self.publisher.take().is_some() {
                        debug!("connection replaced, dropping publish channel");
                    }
                    next_check = Instant::now();
                }
                _ = wait_cancelled(publisher_broken.as_ref()) => {
                    error!("publish channel broken");
                    self.publisher = None;
                    next_check = Instant::now() + self.options.retry_interval;
                }
                _ = sleep_until(next_check) => {
                    next_check = self.ensure_publisher().await;
                }
                Some(cmd) = self.track_rx.recv() => self.handle_track(cmd),
                Some(stopped) = self.stopped_rx.recv() => self.handle_stopped(stopped),
                Some(envelope) = self.send_rx.recv() => self.publish(envelope).await,
            }
        }

        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "transport stopped with unsent envelopes");
        }
        debug!(role = ?self.role, "broker main loop stopped");
    }

    async fn ensure_publisher(&mut self) -> Instant {
        if self.publisher.is_some() {
            return Instant::now() + self.options.check_interval;
        }
        let conn = self.conn_rx.borrow_and_update().clone();
        let Some(conn) = conn else {
            return Instant::now() + self.options.retry_interval;
        };
        match conn.open_publisher().await {
            Ok(publisher) => {
                info!(pending = self.pending.len(), "publish channel ready");
                self.publisher = Some(publisher);
                for envelope in std::mem::take(&mut self.pending) {
                    self.publish_now(&envelope).await;
                }
                Instant::now() + self.options.check_interval
            }
            Err(e) => {
                error!(error = %e, "failed to open publish channel");
                Instant::now() + self.options.retry_interval
            }
        }
    }

    async fn publish(&mut self, envelope: Envelope) {
        // The broken signal may not have been polled yet.
        if self.publisher.as_ref().is_some_and(|p| p.broken().is_cancelled()) {
            self.publisher = None;
        }
        if self.publisher.is_none() {
            debug!(
                channel = %envelope.channel(),
                pending = self.pending.len() + 1,
                "buffering envelope"
            );
            self.pending.push(envelope);
            return;
        }
        self.publish_now(&envelope).await;
    }

    async fn publish_now(&self, envelope: &Envelope) {
        let Some(publisher) = self.publisher.as_ref() else {
            return;
        };
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(talk_id = %envelope.talk_id, error = %e, "failed to encode envelope");
                return;
            }
        };
        let exchange = exchange_name(envelope.channel());
        if let Err(e) = publisher.publish(&exchange, &payload).await {
            error!(exchange = %exchange, error = %e, "publish failed");
        }
    }

    fn handle_track(&mut self, cmd: TrackCommand) {
        match cmd {
            TrackCommand::Start(channel) => match self.tracks.get(&channel) {
                Some(entry) if !entry.cancel.is_cancelled() => {
                    warn!(channel = %channel, "channel already tracked");
                }
                _ => self.start_track(channel),
            },
            TrackCommand::Stop(channel) => match self.tracks.get(&channel) {
                Some(entry) => {
                    debug!(channel = %channel, "stopping track");
                    entry.cancel.cancel();
                }
                None => debug!(channel = %channel, "untrack for unknown channel"),
            },
        }
    }

    fn handle_stopped(&mut self, stopped: TrackStopped) {
        let current = self.tracks.get(&stopped.channel).map(|e| e.generation);
        if current == Some(stopped.generation) {
            self.tracks.remove(&stopped.channel);
            debug!(channel = %stopped.channel, "track removed");
        }
    }

    fn start_track(&mut self, channel: String) {
        self.next_generation += 1;
        let cancel = self.cancel.child_token();
        let routine = TrackRoutine {
            exchange: exchange_name(&channel),
            channel: channel.clone(),
            generation: self.next_generation,
            role: self.role,
            retry_interval: self.options.retry_interval,
            conn_rx: self.conn_rx.clone(),
            observers: self.observers.clone(),
            stopped_tx: self.stopped_tx.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(routine.run());
        self.tracks.insert(
            channel,
            TrackEntry {
                cancel,
                generation: self.next_generation,
            },
        );
    }
}

struct TrackRoutine {
    channel: String,
    exchange: String,
    generation: u64,
    role: Role,
    retry_interval: Duration,
    conn_rx: watch::Receiver<ConnectionSlot>,
    observers: Arc<Observers>,
    stopped_tx: mpsc::Sender<TrackStopped>,
    cancel: CancellationToken,
}

async fn next_delivery(deliveries: &mut Option<Deliveries>) -> Option<Result<Vec<u8>>> {
    match deliveries {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl TrackRoutine {
    async fn run(mut self) {
        debug!(channel = %self.channel, "track started");
        let mut deliveries: Option<Deliveries> = None;
        let mut next_try = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = self.conn_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // subscriptions die with the connection they were made on
                    deliveries = None;
                    next_try = Instant::now();
                }
                _ = sleep_until(next_try), if deliveries.is_none() => {
                    next_try = Instant::now() + self.retry_interval;
                    let conn = self.conn_rx.borrow_and_update().clone();
                    if let Some(conn) = conn {
                        match conn.subscribe(&self.exchange).await {
                            Ok(stream) => {
                                info!(channel = %self.channel, "subscribed");
                                deliveries = Some(stream);
                            }
                            Err(e) => {
                                error!(channel = %self.channel, error = %e, "subscribe failed")
                            }
                        }
                    }
                }
                item = next_delivery(&mut deliveries), if deliveries.is_some() => match item {
                    Some(Ok(body)) => dispatch(self.role, &self.observers, &body),
                    Some(Err(e)) => {
                        error!(channel = %self.channel, error = %e, "subscription channel broken");
                        deliveries = None;
                        next_try = Instant::now() + self.retry_interval;
                    }
                    None => {
                        warn!(channel = %self.channel, "subscription ended");
                        deliveries = None;
                        next_try = Instant::now() + self.retry_interval;
                    }
                },
            }
        }

        debug!(channel = %self.channel, "track stopped");
        let _ = self
            .stopped_tx
            .send(TrackStopped {
                channel: self.channel,
                generation: self.generation,
            })
            .await;
    }
}

/// Decode a delivery and hand it to the observer for `role`.
fn dispatch(role: Role, observers: &Observers, body: &[u8]) {
    let envelope = match Envelope::decode(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "dropping undecodable envelope");
            return;
        }
    };
    let talk_id = envelope.talk_id.as_str();

    match role {
        Role::Customer => {
            let Some(ob) = observers.customer() else {
                debug!("no customer observer, envelope dropped");
                return;
            };
            match &envelope.payload {
                EnvelopePayload::Message {
                    sender_session_id,
                    message,
                } => ob.on_message_incoming(*sender_session_id, talk_id, message),
                EnvelopePayload::TalkClosed => ob.on_talk_closed(talk_id),
                other => debug!(talk_id = %talk_id, "customer side ignores {:?}", other),
            }
        }
        Role::Servicer => {
            let Some(ob) = observers.servicer() else {
                debug!("no servicer observer, envelope dropped");
                return;
            };
            match &envelope.payload {
                EnvelopePayload::Message {
                    sender_session_id,
                    message,
                } => ob.on_message_incoming(*sender_session_id, talk_id, message),
                EnvelopePayload::TalkCreated { talk_id } => ob.on_talk_created(talk_id),
                EnvelopePayload::TalkClosed => ob.on_talk_closed(talk_id),
                EnvelopePayload::ServicerAttached { servicer_id } => {
                    ob.on_servicer_attached(talk_id, *servicer_id)
                }
                EnvelopePayload::ServicerDetached { servicer_id } => {
                    ob.on_servicer_detached(talk_id, *servicer_id)
                }
            }
        }
    }
}
