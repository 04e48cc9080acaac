//! Connection lifecycle per stream target.
//!
//! At most one live connection and one in-flight connect attempt exist per
//! [`StreamTarget`]. Concurrent `connect` calls share the pending attempt.
//! Transport drops are retried on a capped exponential schedule until the
//! attempt budget runs out, at which point the target is marked `Failed` and
//! stays there until a caller connects again.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickstream_metadata::EndpointConfig;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::ReconnectPolicy;
use crate::clock::{epoch_millis, now_tsc};
use crate::endpoint::StreamTarget;
use crate::error::ConnectorError;
use crate::metrics::StreamMetrics;
use crate::traits::{FrameAction, FrameHandler, StreamSession, StreamTransport};
use crate::types::{ConnectionState, ConnectionStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub type ConnectionHandle = Arc<Connection>;

type PendingConnect = Shared<BoxFuture<'static, Result<ConnectionHandle, ConnectorError>>>;

enum Outbound {
    Text(String),
    Close,
}

/// A live connection. Cloning the handle never opens a second session.
pub struct Connection {
    id: u64,
    target: StreamTarget,
    url: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Epoch milliseconds of the last inbound frame
    last_activity: AtomicU64,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn last_activity_at(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Queue a text frame for the reader task to send
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ConnectorError> {
        self.outbound
            .send(Outbound::Text(text.into()))
            .map_err(|_| ConnectorError::SendFailed(format!("{} is closed", self.target)))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("url", &self.url)
            .finish()
    }
}

/// Status transition broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub target: StreamTarget,
    pub state: ConnectionState,
}

struct Live {
    handle: ConnectionHandle,
    reader: JoinHandle<()>,
}

struct Slot {
    state: ConnectionState,
    /// Bumped on caller-initiated disconnect so stale tasks can tell they lost
    generation: u64,
    pending: Option<PendingConnect>,
    live: Option<Live>,
    reconnect_timer: Option<JoinHandle<()>>,
    metrics: StreamMetrics,
}

impl Slot {
    fn new(target: &StreamTarget) -> Self {
        Self {
            state: ConnectionState::default(),
            generation: 0,
            pending: None,
            live: None,
            reconnect_timer: None,
            metrics: StreamMetrics::new(target),
        }
    }
}

struct Inner {
    endpoint: EndpointConfig,
    policy: ReconnectPolicy,
    transport: Arc<dyn StreamTransport>,
    handler: Arc<dyn FrameHandler>,
    slots: Mutex<HashMap<StreamTarget, Slot>>,
    events: broadcast::Sender<ConnectionEvent>,
    next_id: AtomicU64,
}

/// Owns every stream connection of the client
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: EndpointConfig,
        policy: ReconnectPolicy,
        transport: Arc<dyn StreamTransport>,
        handler: Arc<dyn FrameHandler>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                policy,
                transport,
                handler,
                slots: Mutex::new(HashMap::new()),
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Return the live connection for `target`, joining or starting an attempt.
    ///
    /// A caller connect after exhaustion restarts the attempt budget.
    pub async fn connect(&self, target: StreamTarget) -> Result<ConnectionHandle, ConnectorError> {
        let pending = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .entry(target.clone())
                .or_insert_with(|| Slot::new(&target));
            if let Some(live) = &slot.live {
                return Ok(Arc::clone(&live.handle));
            }
            match slot.pending.clone() {
                Some(pending) => pending,
                None => {
                    if let Some(timer) = slot.reconnect_timer.take() {
                        timer.abort();
                    }
                    slot.state.reconnect_attempt = 0;
                    self.inner.start_attempt(slot, &target)
                }
            }
        };
        pending.await
    }

    /// Tear down `target` and cancel any pending reconnect. No reconnect follows.
    pub fn disconnect(&self, target: &StreamTarget) {
        let mut slots = self.inner.slots.lock();
        let Some(slot) = slots.get_mut(target) else {
            return;
        };
        slot.generation += 1;
        if let Some(timer) = slot.reconnect_timer.take() {
            timer.abort();
        }
        slot.pending = None;
        if let Some(live) = slot.live.take() {
            let _ = live.handle.outbound.send(Outbound::Close);
        }
        slot.state.reconnect_attempt = 0;
        info!(target = %target, "Disconnected by caller");
        self.inner.transition(slot, target, ConnectionStatus::Disconnected);
    }

    /// Send a text frame on the live connection for `target`
    pub fn send(&self, target: &StreamTarget, text: impl Into<String>) -> Result<(), ConnectorError> {
        let slots = self.inner.slots.lock();
        match slots.get(target).and_then(|s| s.live.as_ref()) {
            Some(live) => live.handle.send_text(text),
            None => Err(ConnectorError::Disconnected(target.to_string())),
        }
    }

    /// Send the same text frame on every live connection. Returns how many were reached.
    pub fn broadcast(&self, text: &str) -> usize {
        let slots = self.inner.slots.lock();
        slots
            .values()
            .filter_map(|slot| slot.live.as_ref())
            .filter(|live| live.handle.send_text(text).is_ok())
            .count()
    }

    pub fn state(&self, target: &StreamTarget) -> ConnectionState {
        let slots = self.inner.slots.lock();
        slots.get(target).map(Slot::snapshot).unwrap_or_default()
    }

    pub fn states(&self) -> Vec<(StreamTarget, ConnectionState)> {
        let slots = self.inner.slots.lock();
        let mut states: Vec<_> = slots
            .iter()
            .map(|(target, slot)| (target.clone(), slot.snapshot()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Disconnect everything and wait briefly for reader tasks to close their sessions
    pub async fn shutdown(&self) {
        let readers: Vec<JoinHandle<()>> = {
            let mut slots = self.inner.slots.lock();
            let mut readers = Vec::new();
            for (target, slot) in slots.iter_mut() {
                slot.generation += 1;
                if let Some(timer) = slot.reconnect_timer.take() {
                    timer.abort();
                }
                slot.pending = None;
                if let Some(live) = slot.live.take() {
                    let _ = live.handle.outbound.send(Outbound::Close);
                    readers.push(live.reader);
                }
                self.inner.transition(slot, target, ConnectionStatus::Disconnected);
            }
            slots.clear();
            readers
        };
        for reader in readers {
            if tokio::time::timeout(SHUTDOWN_GRACE, reader).await.is_err() {
                warn!("Reader task did not exit within shutdown grace period");
            }
        }
    }
}

impl Slot {
    fn snapshot(&self) -> ConnectionState {
        let mut state = self.state.clone();
        if let Some(live) = &self.live {
            state.last_activity_at = state.last_activity_at.max(live.handle.last_activity_at());
        }
        state
    }
}

impl Inner {
    fn transition(&self, slot: &mut Slot, target: &StreamTarget, status: ConnectionStatus) {
        slot.state.status = status;
        slot.state.last_activity_at = epoch_millis();
        slot.metrics.set_status(status);
        // No receivers is fine
        let _ = self.events.send(ConnectionEvent {
            target: target.clone(),
            state: slot.snapshot(),
        });
    }

    /// Begin a connect attempt for a slot with no live or pending connection
    fn start_attempt(self: &Arc<Self>, slot: &mut Slot, target: &StreamTarget) -> PendingConnect {
        self.transition(slot, target, ConnectionStatus::Connecting);
        let task = tokio::spawn(Arc::clone(self).establish(target.clone(), slot.generation));
        let pending = async move {
            task.await
                .unwrap_or_else(|e| Err(ConnectorError::Cancelled(e.to_string())))
        }
        .boxed()
        .shared();
        slot.pending = Some(pending.clone());
        pending
    }

    async fn establish(
        self: Arc<Self>,
        target: StreamTarget,
        generation: u64,
    ) -> Result<ConnectionHandle, ConnectorError> {
        let opened = match target.url(&self.endpoint) {
            Ok(url) => {
                debug!(target = %target, url = %url, "Opening stream");
                self.transport.open(&url).await.map(|session| (url, session))
            }
            Err(e) => Err(e),
        };
        self.settle(target, generation, opened)
    }

    fn settle(
        self: &Arc<Self>,
        target: StreamTarget,
        generation: u64,
        opened: Result<(String, Box<dyn StreamSession>), ConnectorError>,
    ) -> Result<ConnectionHandle, ConnectorError> {
        let mut slots = self.slots.lock();
        let slot = match slots.get_mut(&target) {
            Some(slot) if slot.generation == generation => slot,
            _ => {
                if let Ok((_, mut session)) = opened {
                    tokio::spawn(async move {
                        let _ = session.close().await;
                    });
                }
                return Err(ConnectorError::Cancelled(format!(
                    "{} disconnected while connecting",
                    target
                )));
            }
        };
        slot.pending = None;

        match opened {
            Ok((url, session)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = Arc::new(Connection {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    target: target.clone(),
                    url,
                    outbound: tx,
                    last_activity: AtomicU64::new(epoch_millis()),
                });
                let reader = tokio::spawn(Arc::clone(self).read_loop(
                    Arc::clone(&handle),
                    generation,
                    session,
                    rx,
                ));
                slot.live = Some(Live {
                    handle: Arc::clone(&handle),
                    reader,
                });
                slot.state.reconnect_attempt = 0;
                info!(target = %target, url = %handle.url, id = handle.id, "Stream connected");
                self.transition(slot, &target, ConnectionStatus::Connected);
                Ok(handle)
            }
            Err(e) => {
                warn!(target = %target, error = %e, "Stream connect failed");
                self.transition(slot, &target, ConnectionStatus::Error);
                self.schedule_reconnect(slot, &target);
                if slot.state.status == ConnectionStatus::Failed {
                    return Err(ConnectorError::Exhausted(slot.state.reconnect_attempt));
                }
                Err(e)
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, slot: &mut Slot, target: &StreamTarget) {
        let attempt = slot.state.reconnect_attempt;
        if !self.policy.allows(attempt) {
            error!(
                target = %target,
                attempts = attempt,
                "Reconnect attempts exhausted, giving up"
            );
            slot.metrics.inc_exhausted();
            self.transition(slot, target, ConnectionStatus::Failed);
            return;
        }

        let delay = self.policy.delay(attempt);
        slot.state.reconnect_attempt = attempt + 1;
        slot.metrics.inc_reconnect();
        info!(
            target = %target,
            attempt = attempt + 1,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let inner = Arc::clone(self);
        let target = target.clone();
        let generation = slot.generation;
        slot.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect_now(&target, generation);
        }));
    }

    fn reconnect_now(self: &Arc<Self>, target: &StreamTarget, generation: u64) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(target) else {
            return;
        };
        if slot.generation != generation || slot.live.is_some() || slot.pending.is_some() {
            return;
        }
        // This task is the timer; dropping its own handle does not abort it
        slot.reconnect_timer = None;
        let _ = self.start_attempt(slot, target);
    }

    async fn read_loop(
        self: Arc<Self>,
        connection: ConnectionHandle,
        generation: u64,
        mut session: Box<dyn StreamSession>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let target = connection.target.clone();
        let metrics = StreamMetrics::new(&target);

        let reason = loop {
            tokio::select! {
                frame = session.recv() => match frame {
                    Some(Ok(frame)) => {
                        let received_tsc = now_tsc();
                        let now_ms = epoch_millis();
                        connection.last_activity.store(now_ms, Ordering::Relaxed);
                        metrics.set_last_activity(now_ms as f64 / 1000.0);

                        if let FrameAction::Reply(text) =
                            self.handler.handle(&target, frame, received_tsc)
                        {
                            trace!(target = %target, "Replying on stream");
                            if let Err(e) = session.send_text(text).await {
                                break e;
                            }
                        }
                    }
                    Some(Err(e)) => break e,
                    None => break ConnectorError::Disconnected("closed by peer".to_string()),
                },

                command = outbound.recv() => match command {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = session.send_text(text).await {
                            break e;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!(target = %target, "Closing stream on request");
                        if let Err(e) = session.close().await {
                            debug!(target = %target, error = %e, "Error closing stream");
                        }
                        return;
                    }
                },
            }
        };

        warn!(target = %target, reason = %reason, "Stream dropped");
        let _ = session.close().await;
        self.on_dropped(&target, generation);
    }

    fn on_dropped(self: &Arc<Self>, target: &StreamTarget, generation: u64) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(target) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        slot.live = None;
        self.transition(slot, target, ConnectionStatus::Disconnected);
        self.schedule_reconnect(slot, target);
    }
}
