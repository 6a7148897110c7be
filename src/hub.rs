//! Real-time event fan-out to connected observers
//!
//! One coordinator task owns the observer table and serializes registration,
//! removal and broadcast. Every observer gets a bounded outbound queue, a
//! writer loop draining it to the observer's sink and a reader loop handling
//! inbound control frames. A full queue marks a slow consumer, which is
//! dropped instead of blocking the broadcast.

use crate::model::{Alert, ServerMetrics, ServerStatus};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Identifier assigned to each attached observer
pub type ObserverId = u64;

/// Hub tuning
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound frames buffered per observer before it counts as slow
    pub queue_capacity: usize,
    /// Interval between transport-level pings
    pub ping_interval: Duration,
    /// Observers silent for this long are dropped
    pub read_deadline: Duration,
    /// Bound on a single outbound write
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ping_interval: Duration::from_secs(30),
            read_deadline: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Something observers may want to hear about
#[derive(Debug, Clone)]
pub enum Event {
    StatusChange { server_id: String, status: ServerStatus },
    Alert(Alert),
    Metrics(ServerMetrics),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload<'a> {
    server_id: &'a str,
    status: ServerStatus,
}

#[derive(Serialize)]
struct OutboundFrame<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: T,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::StatusChange { .. } => "status_change",
            Event::Alert(_) => "alert",
            Event::Metrics(_) => "metrics",
        }
    }

    /// Server id used for interest filtering. Unfiltered events reach everyone.
    pub fn filter_key(&self) -> Option<&str> {
        match self {
            Event::Metrics(metrics) => Some(&metrics.server_id),
            Event::StatusChange { .. } | Event::Alert(_) => None,
        }
    }

    /// Encode as a `{type, payload}` text frame
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let kind = self.kind();
        match self {
            Event::StatusChange { server_id, status } => serde_json::to_string(&OutboundFrame {
                kind,
                payload: StatusPayload {
                    server_id,
                    status: *status,
                },
            }),
            Event::Alert(alert) => serde_json::to_string(&OutboundFrame { kind, payload: alert }),
            Event::Metrics(metrics) => serde_json::to_string(&OutboundFrame { kind, payload: metrics }),
        }
    }
}

/// Transport-agnostic message exchanged with an observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Ping,
    Pong,
    Close,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribePayload {
    #[serde(default)]
    server_ids: Vec<String>,
}

/// Inbound control message from an observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Ping,
}

impl ControlMessage {
    /// Parse a text frame; anything unrecognized yields `None`
    pub fn parse(text: &str) -> Option<Self> {
        let frame: InboundFrame = serde_json::from_str(text).ok()?;
        match frame.kind.as_str() {
            "subscribe" => {
                let payload: SubscribePayload = serde_json::from_value(frame.payload).ok()?;
                Some(ControlMessage::Subscribe(payload.server_ids))
            }
            "unsubscribe" => {
                let payload: SubscribePayload = serde_json::from_value(frame.payload).ok()?;
                Some(ControlMessage::Unsubscribe(payload.server_ids))
            }
            "ping" => Some(ControlMessage::Ping),
            _ => None,
        }
    }
}

/// Per-observer interest set
#[derive(Debug, Default, Clone)]
pub struct Subscription {
    server_ids: HashSet<String>,
}

impl Subscription {
    /// Id that matches every server
    pub const WILDCARD: &'static str = "*";

    pub fn subscribe<I: IntoIterator<Item = String>>(&mut self, ids: I) {
        self.server_ids.extend(ids);
    }

    pub fn unsubscribe<I: IntoIterator<Item = String>>(&mut self, ids: I) {
        for id in ids {
            self.server_ids.remove(&id);
        }
    }

    pub fn matches(&self, server_id: &str) -> bool {
        self.server_ids.contains(Self::WILDCARD) || self.server_ids.contains(server_id)
    }

    pub fn is_empty(&self) -> bool {
        self.server_ids.is_empty()
    }
}

struct ObserverHandle {
    queue: mpsc::Sender<String>,
    subscription: Arc<Mutex<Subscription>>,
}

enum HubCommand {
    Register {
        id: ObserverId,
        observer: ObserverHandle,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        id: ObserverId,
    },
    Broadcast(Event),
    Count(oneshot::Sender<usize>),
}

/// Publish/subscribe broker for dashboard observers.
///
/// The hub is created behind an `Arc` so connection handlers can share it.
pub struct EventHub {
    commands: mpsc::UnboundedSender<HubCommand>,
    config: HubConfig,
    next_id: AtomicU64,
}

impl EventHub {
    /// Create the hub and start its coordinator task
    pub fn new(config: HubConfig) -> Arc<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(coordinate(rx));

        debug!(
            queue_capacity = config.queue_capacity,
            ping_interval_secs = config.ping_interval.as_secs(),
            read_deadline_secs = config.read_deadline.as_secs(),
            "Event hub started"
        );

        Arc::new(Self {
            commands,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Queue an event for fan-out. Never blocks.
    pub fn publish(&self, event: Event) {
        if self.commands.send(HubCommand::Broadcast(event)).is_err() {
            warn!("Event hub coordinator is gone, dropping event");
        }
    }

    pub fn broadcast_alert(&self, alert: Alert) {
        self.publish(Event::Alert(alert));
    }

    pub fn broadcast_status_change(&self, server_id: &str, status: ServerStatus) {
        self.publish(Event::StatusChange {
            server_id: server_id.to_string(),
            status,
        });
    }

    pub fn broadcast_metrics(&self, metrics: ServerMetrics) {
        self.publish(Event::Metrics(metrics));
    }

    /// Number of registered observers, counted after every command queued
    /// before this call has been processed
    pub async fn observer_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Attach an observer speaking [`WireMessage`]s over `sink` and `stream`.
    ///
    /// Returns once the observer is registered; events published afterwards
    /// reach it, earlier ones never do.
    pub async fn attach<S, R, E>(&self, sink: S, stream: R) -> ObserverId
    where
        S: Sink<WireMessage> + Send + Unpin + 'static,
        S::Error: Display,
        R: Stream<Item = Result<WireMessage, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let subscription = Arc::new(Mutex::new(Subscription::default()));
        let pong_queue = queue_tx.downgrade();

        let (ack_tx, ack_rx) = oneshot::channel();
        let registered = self.commands.send(HubCommand::Register {
            id,
            observer: ObserverHandle {
                queue: queue_tx,
                subscription: Arc::clone(&subscription),
            },
            ack: ack_tx,
        });
        if registered.is_ok() {
            let _ = ack_rx.await;
        }

        // Dropped by the writer on exit, which stops the reader
        let (done_tx, done_rx) = watch::channel(());

        tokio::spawn(write_loop(
            id,
            sink,
            queue_rx,
            self.config.clone(),
            self.commands.clone(),
            done_tx,
        ));
        tokio::spawn(read_loop(
            id,
            stream,
            pong_queue,
            subscription,
            self.config.clone(),
            self.commands.clone(),
            done_rx,
        ));

        info!(observer = id, "Observer attached");
        id
    }

    /// Remove an observer. Safe to call more than once.
    pub fn detach(&self, id: ObserverId) {
        let _ = self.commands.send(HubCommand::Unregister { id });
    }
}

async fn coordinate(mut commands: mpsc::UnboundedReceiver<HubCommand>) {
    let mut observers: HashMap<ObserverId, ObserverHandle> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            HubCommand::Register { id, observer, ack } => {
                observers.insert(id, observer);
                let _ = ack.send(());
            }
            HubCommand::Unregister { id } => {
                // Dropping the handle closes the queue; the writer drains
                // what is left and then closes the connection
                if observers.remove(&id).is_some() {
                    debug!(observer = id, remaining = observers.len(), "Observer unregistered");
                }
            }
            HubCommand::Broadcast(event) => {
                let frame = match event.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(kind = event.kind(), error = %e, "Failed to encode event");
                        continue;
                    }
                };

                let mut evicted = Vec::new();
                for (id, observer) in &observers {
                    if let Some(server_id) = event.filter_key() {
                        if !observer.subscription.lock().matches(server_id) {
                            continue;
                        }
                    }
                    match observer.queue.try_send(frame.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(observer = id, kind = event.kind(), "Observer queue full, dropping slow consumer");
                            evicted.push(*id);
                        }
                        Err(TrySendError::Closed(_)) => evicted.push(*id),
                    }
                }
                for id in evicted {
                    observers.remove(&id);
                }
            }
            HubCommand::Count(reply) => {
                let _ = reply.send(observers.len());
            }
        }
    }

    debug!("Event hub coordinator stopped");
}

async fn write_loop<S>(
    id: ObserverId,
    mut sink: S,
    mut queue: mpsc::Receiver<String>,
    config: HubConfig,
    commands: mpsc::UnboundedSender<HubCommand>,
    _done: watch::Sender<()>,
) where
    S: Sink<WireMessage> + Send + Unpin + 'static,
    S::Error: Display,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        let message = tokio::select! {
            frame = queue.recv() => match frame {
                Some(text) => WireMessage::Text(text),
                None => {
                    let _ = timeout(config.write_timeout, sink.send(WireMessage::Close)).await;
                    break;
                }
            },
            _ = ticker.tick() => WireMessage::Ping,
        };

        match timeout(config.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(observer = id, error = %e, "Observer write failed");
                break;
            }
            Err(_) => {
                debug!(observer = id, "Observer write timed out");
                break;
            }
        }
    }

    let _ = commands.send(HubCommand::Unregister { id });
    debug!(observer = id, "Observer writer finished");
}

async fn read_loop<R, E>(
    id: ObserverId,
    mut stream: R,
    pong_queue: mpsc::WeakSender<String>,
    subscription: Arc<Mutex<Subscription>>,
    config: HubConfig,
    commands: mpsc::UnboundedSender<HubCommand>,
    mut done: watch::Receiver<()>,
) where
    R: Stream<Item = Result<WireMessage, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = done.changed() => break,
            next = timeout(config.read_deadline, stream.next()) => next,
        };

        match next {
            Err(_) => {
                info!(observer = id, "Observer missed read deadline");
                break;
            }
            Ok(None) | Ok(Some(Ok(WireMessage::Close))) => break,
            Ok(Some(Err(e))) => {
                debug!(observer = id, error = %e, "Observer read failed");
                break;
            }
            // Any inbound frame, pong included, resets the deadline
            Ok(Some(Ok(WireMessage::Ping | WireMessage::Pong))) => {}
            Ok(Some(Ok(WireMessage::Text(text)))) => match ControlMessage::parse(&text) {
                Some(ControlMessage::Subscribe(ids)) => subscription.lock().subscribe(ids),
                Some(ControlMessage::Unsubscribe(ids)) => subscription.lock().unsubscribe(ids),
                Some(ControlMessage::Ping) => {
                    if let Some(queue) = pong_queue.upgrade() {
                        let _ = queue.try_send(PONG_FRAME.to_string());
                    }
                }
                None => debug!(observer = id, "Ignoring malformed control frame"),
            },
        }
    }

    let _ = commands.send(HubCommand::Unregister { id });
    debug!(observer = id, "Observer reader finished");
}

const PONG_FRAME: &str = r#"{"type":"pong","payload":{}}"#;
