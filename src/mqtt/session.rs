//! The single-owner MQTT session client.
//!
//! One [`SessionClient`] owns exactly one broker link at a time. The link is
//! driven by a receive loop task that fans every inbound publish out to the
//! per-pattern [`BufferSet`] and, if a recording is attached, to the
//! [`SessionRecorder`]. UI code never talks to rumqttc directly; it calls
//! [`SessionClient::subscribe_many`], [`SessionClient::get_buffer`] and
//! [`SessionClient::publish`].
//!
//! # Connection state
//!
//! ```text
//! Init ──► Connecting ──► Connected ◄──► Reconnecting
//!                              │               │
//!                              └──► Stopped ◄──┘   (stop)
//! ```
//!
//! [`SessionClient::reconnect`] goes `Connected → Reconnecting → Connected`
//! without visiting `Stopped`; the old link is fully closed before the new
//! one is opened.

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS, SubscribeFilter, SubscribeReasonCode, Transport,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::{BufferSet, DEFAULT_BUFFER_SIZE};
use super::error::TransportError;
use super::message::{EnvelopeMessage, Payload};
use super::publisher::{PublishFuture, PublishId, Publisher};
use super::topic::TopicPattern;
use crate::config::{AppConfig, ConnectionDescriptor, Environment, RecorderConfig};
use crate::recorder::{RecorderStatus, SessionRecorder, StorageError};

/// Retained presence topic, also used as last will.
pub const STATUS_TOPIC: &str = "monitor/status";

const REQUEST_CAPACITY: usize = 100;
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const CLOSE_GRACE: Duration = Duration::from_millis(500);

static SHARED: OnceLock<Arc<SessionClient>> = OnceLock::new();

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Init,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Point-in-time view for status panels.
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub environment: Environment,
    pub address: String,
    pub client_id: String,
    pub messages_received: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub last_error: Option<String>,
    pub live_handles: usize,
    pub buffers: usize,
    pub recorder: Option<RecorderStatus>,
}

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: min,
            min,
            max,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Counts network handles that are alive. Decrements when the loop exits.
struct LiveHandle(Arc<AtomicUsize>);

impl LiveHandle {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Link {
    generation: u64,
    client: AsyncClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct RecorderAttachment {
    recorder: SessionRecorder,
    filter: TopicPattern,
    owns_subscription: bool,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
}

pub struct SessionClient {
    descriptor: RwLock<ConnectionDescriptor>,
    buffers: BufferSet,
    subscriptions: RwLock<BTreeMap<String, QoS>>,
    state_tx: watch::Sender<ConnectionState>,
    connected: AtomicBool,
    publisher: RwLock<Option<AsyncClient>>,
    link: tokio::sync::Mutex<Option<Link>>,
    generation: AtomicU64,
    live_handles: Arc<AtomicUsize>,
    publish_seq: AtomicU64,
    counters: Counters,
    last_error: Mutex<Option<String>>,
    recorder: RwLock<Option<RecorderAttachment>>,
}

impl SessionClient {
    fn new(descriptor: ConnectionDescriptor, buffer_size: usize) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Init);
        Self {
            descriptor: RwLock::new(descriptor),
            buffers: BufferSet::new(buffer_size),
            subscriptions: RwLock::new(BTreeMap::new()),
            state_tx,
            connected: AtomicBool::new(false),
            publisher: RwLock::new(None),
            link: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            live_handles: Arc::new(AtomicUsize::new(0)),
            publish_seq: AtomicU64::new(0),
            counters: Counters::default(),
            last_error: Mutex::new(None),
            recorder: RwLock::new(None),
        }
    }

    /// The process-wide client. Every UI component goes through here.
    ///
    /// The first call fixes the initial descriptor from `config`; later
    /// environment changes go through [`SessionClient::reconnect`].
    pub fn shared(config: &AppConfig) -> Arc<SessionClient> {
        SHARED
            .get_or_init(|| {
                info!(
                    "Creating shared session client for {}",
                    config.default_environment
                );
                Arc::new(SessionClient::new(
                    config.descriptor(config.default_environment),
                    config.buffers.max_size,
                ))
            })
            .clone()
    }

    /// A standalone client for tools and tests. Not for UI code, which must
    /// use [`SessionClient::shared`].
    pub fn ephemeral(descriptor: ConnectionDescriptor) -> Arc<SessionClient> {
        Self::ephemeral_with_capacity(descriptor, DEFAULT_BUFFER_SIZE)
    }

    pub fn ephemeral_with_capacity(
        descriptor: ConnectionDescriptor,
        buffer_size: usize,
    ) -> Arc<SessionClient> {
        debug!("Creating ephemeral session client for {}", descriptor);
        Arc::new(SessionClient::new(descriptor, buffer_size))
    }

    pub fn descriptor(&self) -> ConnectionDescriptor {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Lifecycle hook: a receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of broker links currently alive. Never exceeds one.
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    /// Starts the receive loop and waits for the first handshake.
    ///
    /// Calling it while a link exists does nothing. A failed handshake is
    /// reported, but the loop keeps retrying in the background until
    /// [`SessionClient::stop`].
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            debug!("connect() called with an active link, ignoring");
            return if self.is_connected() {
                Ok(())
            } else {
                Err(TransportError::NotConnected)
            };
        }

        self.set_state(ConnectionState::Connecting);
        let (new_link, handshake) = self.open_link();
        *link = Some(new_link);
        drop(link);

        self.await_handshake(handshake).await
    }

    /// Terminates the receive loop and closes the link. Buffers are kept.
    pub async fn stop(&self) {
        let mut link = self.link.lock().await;
        if let Some(old) = link.take() {
            self.close_link(old).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.publisher.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.set_state(ConnectionState::Stopped);
        info!("Session client stopped");
    }

    /// Swaps the broker: closes the current link, clears history and
    /// connects with `descriptor`. Subscriptions carry over.
    pub async fn reconnect(
        self: &Arc<Self>,
        descriptor: ConnectionDescriptor,
    ) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        info!("Reconnecting session client to {}", descriptor);

        self.set_state(ConnectionState::Reconnecting);
        if let Some(old) = link.take() {
            self.close_link(old).await;
        }
        self.connected.store(false, Ordering::SeqCst);

        *self.descriptor.write().unwrap_or_else(PoisonError::into_inner) = descriptor;
        self.clear_history();

        let (new_link, handshake) = self.open_link();
        *link = Some(new_link);
        drop(link);

        self.await_handshake(handshake).await
    }

    pub async fn switch_environment(
        self: &Arc<Self>,
        env: Environment,
        config: &AppConfig,
    ) -> Result<(), TransportError> {
        self.reconnect(config.descriptor(env)).await
    }

    /// Registers interest in `patterns`, creating their buffers. Idempotent.
    pub fn subscribe_many<I, S>(&self, patterns: I, qos: QoS) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            self.buffers.ensure(pattern)?;
            if self.add_subscription(pattern, qos) {
                added.push(pattern.to_string());
            }
        }

        if !added.is_empty() {
            debug!("Subscribing to {:?}", added);
            self.send_subscriptions(added.into_iter().map(|p| SubscribeFilter::new(p, qos)));
        }
        Ok(())
    }

    pub fn unsubscribe(&self, pattern: &str) {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pattern)
            .is_some();
        if !removed {
            return;
        }
        if let Some(client) = self.live_publisher() {
            if let Err(e) = client.try_unsubscribe(pattern) {
                warn!("Failed to unsubscribe from {}: {}", pattern, e);
            }
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Point-in-time copy of a buffer, oldest first.
    pub fn get_buffer(&self, pattern: &str) -> Vec<Arc<EnvelopeMessage>> {
        match self.buffers.snapshot(pattern) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Cannot read buffer for '{}': {}", pattern, e);
                Vec::new()
            }
        }
    }

    pub fn latest(&self, pattern: &str) -> Option<Arc<EnvelopeMessage>> {
        self.buffers.ensure(pattern).ok()?.latest()
    }

    pub fn buffer_patterns(&self) -> Vec<String> {
        self.buffers.patterns()
    }

    /// Empties every buffer, used on environment switches.
    pub fn clear_history(&self) {
        self.buffers.clear_all();
        debug!("Cleared message history");
    }

    /// Publishes, returning `None` when not connected or on error.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        qos: QoS,
        retain: bool,
    ) -> Option<PublishId> {
        self.try_publish(topic, payload.into(), qos, retain).ok()
    }

    pub fn try_publish(
        &self,
        topic: &str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishId, TransportError> {
        let result = self.publish_inner(topic, payload, qos, retain);
        if let Err(e) = &result {
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            debug!("Publish to {} rejected: {}", topic, e);
        }
        result
    }

    fn publish_inner(
        &self,
        topic: &str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishId, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let client = self.live_publisher().ok_or(TransportError::NotConnected)?;

        client
            .try_publish(topic, qos, retain, payload.raw().to_vec())
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(self.accept_publish(topic, payload, qos, retain))
    }

    /// Publishes, waiting for room in the client's request queue when it
    /// is full instead of failing.
    pub async fn publish_queued(
        &self,
        topic: &str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishId, TransportError> {
        let result = self.publish_queued_inner(topic, payload, qos, retain).await;
        if let Err(e) = &result {
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            debug!("Publish to {} rejected: {}", topic, e);
        }
        result
    }

    async fn publish_queued_inner(
        &self,
        topic: &str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishId, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let client = self.live_publisher().ok_or(TransportError::NotConnected)?;

        client
            .publish(topic, qos, retain, payload.raw().to_vec())
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(self.accept_publish(topic, payload, qos, retain))
    }

    fn accept_publish(&self, topic: &str, payload: Payload, qos: QoS, retain: bool) -> PublishId {
        let id = self.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!("Published {} ({} bytes) as #{}", topic, payload.len(), id);
        self.record_outbound(topic, payload, qos, retain, id);
        id
    }

    /// Hands an accepted publish to the active recorder, if any. Outbound
    /// traffic is recorded regardless of the recording filter.
    fn record_outbound(
        &self,
        topic: &str,
        payload: Payload,
        qos: QoS,
        retain: bool,
        id: PublishId,
    ) {
        if let Some(attachment) = self
            .recorder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            attachment.recorder.record(Arc::new(EnvelopeMessage::outbound(
                topic, payload, qos, retain, id,
            )));
        }
    }

    /// Receive-loop entry: stores an inbound message in every matching
    /// buffer and hands it to the recorder. Returns the buffer count.
    pub fn ingest(&self, topic: &str, payload: Payload, qos: QoS, retain: bool) -> usize {
        let message = Arc::new(EnvelopeMessage::inbound(topic, payload, qos, retain));
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let delivered = self.buffers.dispatch(&message);

        if let Some(attachment) = self
            .recorder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            if attachment.filter.matches(topic) {
                attachment.recorder.record(Arc::clone(&message));
            }
        }
        delivered
    }

    /// Attaches a recorder that stores inbound messages matching `filter`
    /// and every outbound publish.
    pub fn start_recording(
        &self,
        path: &Path,
        filter: &str,
        config: &RecorderConfig,
    ) -> Result<(), StorageError> {
        let pattern = TopicPattern::parse(filter).map_err(|e| {
            StorageError::Serialize(format!("invalid recorder filter '{}': {}", filter, e))
        })?;
        let recorder = SessionRecorder::start(path, config)?;

        let owns_subscription = self.add_subscription(filter, QoS::AtLeastOnce);
        if owns_subscription {
            self.send_subscriptions(std::iter::once(SubscribeFilter::new(
                filter.to_string(),
                QoS::AtLeastOnce,
            )));
        }

        let previous = self
            .recorder
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(RecorderAttachment {
                recorder,
                filter: pattern,
                owns_subscription,
            });
        if let Some(previous) = previous {
            warn!("Replacing active recording {}", previous.recorder.path().display());
            previous.recorder.stop();
        }
        info!("Recording {} to {}", filter, path.display());
        Ok(())
    }

    /// Detaches and flushes the recorder. Blocks until the writer is done.
    pub fn stop_recording(&self) -> Option<RecorderStatus> {
        let attachment = self
            .recorder
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let status = attachment.recorder.stop();
        let filter = attachment.filter.as_str();
        if attachment.owns_subscription && self.buffers.get(filter).is_none() {
            self.unsubscribe(filter);
        }
        Some(status)
    }

    pub fn recorder_status(&self) -> Option<RecorderStatus> {
        self.recorder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.recorder.status())
    }

    pub fn status(&self) -> SessionStatus {
        let descriptor = self.descriptor();
        SessionStatus {
            state: self.state(),
            environment: descriptor.environment,
            address: descriptor.address(),
            client_id: descriptor.client_id,
            messages_received: self.counters.received.load(Ordering::Relaxed),
            messages_published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            live_handles: self.live_handles(),
            buffers: self.buffers.patterns().len(),
            recorder: self.recorder_status(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Session state {:?} -> {:?}", previous, state);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn live_publisher(&self) -> Option<AsyncClient> {
        self.publisher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn add_subscription(&self, pattern: &str, qos: QoS) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if subs.contains_key(pattern) {
            false
        } else {
            subs.insert(pattern.to_string(), qos);
            true
        }
    }

    /// Sends subscribe requests when connected. Otherwise they go out with
    /// the full set on the next CONNACK.
    fn send_subscriptions(&self, filters: impl Iterator<Item = SubscribeFilter>) {
        if !self.is_connected() {
            return;
        }
        let Some(client) = self.live_publisher() else {
            return;
        };
        let filters: Vec<SubscribeFilter> = filters.collect();
        if filters.is_empty() {
            return;
        }
        if let Err(e) = client.try_subscribe_many(filters) {
            warn!("Subscribe request failed, will retry on reconnect: {}", e);
        }
    }

    fn open_link(self: &Arc<Self>) -> (Link, oneshot::Receiver<Result<(), TransportError>>) {
        let descriptor = self.descriptor();
        let (client, eventloop) = AsyncClient::new(mqtt_options(&descriptor), REQUEST_CAPACITY);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let guard = LiveHandle::acquire(&self.live_handles);

        *self.publisher.write().unwrap_or_else(PoisonError::into_inner) = Some(client.clone());

        info!(
            "Opening broker link #{} to {} as {}",
            generation, descriptor, descriptor.client_id
        );
        let task = tokio::spawn(run_receive_loop(
            Arc::downgrade(self),
            generation,
            client.clone(),
            eventloop,
            cancel.clone(),
            handshake_tx,
            guard,
        ));

        (
            Link {
                generation,
                client,
                cancel,
                task,
            },
            handshake_rx,
        )
    }

    async fn close_link(&self, link: Link) {
        let Link {
            generation,
            client,
            cancel,
            mut task,
        } = link;
        debug!("Closing broker link #{}", generation);

        if self.is_connected() && client.try_disconnect().is_ok() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_ok() {
                debug!("Broker link #{} disconnected gracefully", generation);
                return;
            }
        }

        cancel.cancel();
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            warn!("Broker link #{} did not stop in time, aborting", generation);
            task.abort();
            let _ = task.await;
        }
    }

    async fn await_handshake(
        &self,
        handshake: oneshot::Receiver<Result<(), TransportError>>,
    ) -> Result<(), TransportError> {
        let timeout = self.descriptor().connect_timeout;
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                warn!("No CONNACK within {:?}, continuing in background", timeout);
                Err(TransportError::ConnectTimeout(timeout))
            }
        }
    }

    fn on_connected(&self, generation: u64, client: &AsyncClient) {
        if !self.is_current(generation) {
            return;
        }
        self.connected.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);

        let descriptor = self.descriptor();
        info!("Connected to {}", descriptor);

        let filters: Vec<SubscribeFilter> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(pattern, qos)| SubscribeFilter::new(pattern.clone(), *qos))
            .collect();
        if !filters.is_empty() {
            debug!("Re-registering {} subscriptions", filters.len());
            if let Err(e) = client.try_subscribe_many(filters) {
                warn!("Failed to re-register subscriptions: {}", e);
            }
        }

        if descriptor.last_will {
            let online = json!({"client_id": descriptor.client_id, "state": "online"});
            if let Err(e) =
                client.try_publish(STATUS_TOPIC, QoS::AtLeastOnce, true, online.to_string())
            {
                warn!("Failed to announce presence: {}", e);
            }
        }
    }

    fn on_connection_error(&self, generation: u64, reason: &str) {
        if !self.is_current(generation) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(reason.to_string());
        if self.state() != ConnectionState::Stopped {
            self.set_state(ConnectionState::Reconnecting);
        }
    }
}

impl Publisher for SessionClient {
    fn publish_message(
        &self,
        topic: &str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishId, TransportError> {
        self.try_publish(topic, payload, qos, retain)
    }

    fn publish_awaiting<'a>(
        &'a self,
        topic: &'a str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> PublishFuture<'a> {
        Box::pin(self.publish_queued(topic, payload, qos, retain))
    }
}

fn mqtt_options(descriptor: &ConnectionDescriptor) -> MqttOptions {
    let mut options = MqttOptions::new(
        descriptor.client_id.clone(),
        descriptor.host.clone(),
        descriptor.port,
    );
    options
        .set_keep_alive(descriptor.keepalive.max(Duration::from_secs(5)))
        .set_clean_session(descriptor.clean_session);

    if let Some(user) = &descriptor.username {
        options.set_credentials(
            user.clone(),
            descriptor.password.clone().unwrap_or_default(),
        );
    }
    if descriptor.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    if descriptor.last_will {
        let offline = json!({"client_id": descriptor.client_id, "state": "offline"});
        options.set_last_will(LastWill::new(
            STATUS_TOPIC,
            offline.to_string(),
            QoS::AtLeastOnce,
            true,
        ));
    }
    options
}

async fn run_receive_loop(
    session: Weak<SessionClient>,
    generation: u64,
    client: AsyncClient,
    mut eventloop: EventLoop,
    cancel: CancellationToken,
    handshake: oneshot::Sender<Result<(), TransportError>>,
    _live: LiveHandle,
) {
    let mut backoff = Backoff::new(MIN_BACKOFF, MAX_BACKOFF);
    let mut handshake = Some(handshake);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        let failure = {
            let Some(session) = session.upgrade() else {
                debug!("Session client dropped, ending link #{}", generation);
                break;
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        backoff.reset();
                        session.on_connected(generation, &client);
                        if let Some(tx) = handshake.take() {
                            let _ = tx.send(Ok(()));
                        }
                        None
                    } else {
                        Some(format!("connection refused: {:?}", ack.code))
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    session.ingest(
                        &publish.topic,
                        Payload::from_bytes(publish.payload),
                        publish.qos,
                        publish.retain,
                    );
                    None
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let rejected = ack
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count();
                    if rejected > 0 {
                        warn!(
                            "Broker rejected {} subscription(s), retrying on next connect",
                            rejected
                        );
                    }
                    None
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    Some("broker sent DISCONNECT".to_string())
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Link #{} sent DISCONNECT", generation);
                    break;
                }
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            }
        };

        if let Some(reason) = failure {
            if let Some(session) = session.upgrade() {
                session.on_connection_error(generation, &reason);
            }
            if let Some(tx) = handshake.take() {
                let _ = tx.send(Err(TransportError::ConnectFailed(reason.clone())));
            }

            let delay = backoff.next_delay();
            warn!(
                "Link #{} lost ({}), retrying in {:?}",
                generation, reason, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    if let Some(session) = session.upgrade() {
        if session.is_current(generation) {
            session.connected.store(false, Ordering::SeqCst);
        }
    }
    debug!("Receive loop for link #{} exited", generation);
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Ok(mut link) = self.link.try_lock() {
            if let Some(link) = link.take() {
                link.cancel.cancel();
            }
        }
        if let Ok(mut recorder) = self.recorder.write() {
            if let Some(attachment) = recorder.take() {
                attachment.recorder.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionDescriptor;
    use tempfile::TempDir;

    fn unreachable(port: u16) -> ConnectionDescriptor {
        let mut descriptor = ConnectionDescriptor::local("127.0.0.1", port);
        descriptor.connect_timeout = Duration::from_millis(500);
        descriptor
    }

    fn state_payload(n: usize) -> Payload {
        Payload::from_text(format!("{{\"n\":{}}}", n))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(MIN_BACKOFF, MAX_BACKOFF);
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), MIN_BACKOFF);
    }

    #[test]
    fn publish_without_connection_returns_none() {
        let client = SessionClient::ephemeral(unreachable(1));
        assert_eq!(client.publish("ccu/order/request", "{}", QoS::ExactlyOnce, false), None);
        assert_eq!(client.status().publish_failures, 1);
    }

    #[test]
    fn ingest_fans_out_to_overlapping_patterns() {
        let client = SessionClient::ephemeral(unreachable(1));
        client
            .subscribe_many(
                ["module/v1/ff/+/state", "module/v1/ff/SVR3QA0022/state"],
                QoS::AtLeastOnce,
            )
            .unwrap();

        let delivered = client.ingest(
            "module/v1/ff/SVR3QA0022/state",
            state_payload(1),
            QoS::AtLeastOnce,
            false,
        );
        assert_eq!(delivered, 2);
        assert_eq!(client.get_buffer("module/v1/ff/+/state").len(), 1);
        assert_eq!(client.get_buffer("module/v1/ff/SVR3QA0022/state").len(), 1);
    }

    #[test]
    fn subscribe_is_idempotent_and_rejects_bad_filters() {
        let client = SessionClient::ephemeral(unreachable(1));
        client.subscribe_many(["ccu/#"], QoS::AtLeastOnce).unwrap();
        client.subscribe_many(["ccu/#"], QoS::AtLeastOnce).unwrap();
        assert_eq!(client.subscriptions(), vec!["ccu/#".to_string()]);
        assert!(client.subscribe_many(["a/#/b"], QoS::AtLeastOnce).is_err());
    }

    #[test]
    fn buffer_is_bounded_by_capacity() {
        let client = SessionClient::ephemeral_with_capacity(unreachable(1), 10);
        client.subscribe_many(["t/+"], QoS::AtMostOnce).unwrap();
        for i in 0..25 {
            client.ingest("t/x", state_payload(i), QoS::AtMostOnce, false);
        }
        let buffer = client.get_buffer("t/+");
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer[0].payload.text(), "{\"n\":15}");
        assert_eq!(buffer[9].payload.text(), "{\"n\":24}");
    }

    #[test]
    fn malformed_payload_is_stored_not_dropped() {
        let client = SessionClient::ephemeral(unreachable(1));
        client.subscribe_many(["bin"], QoS::AtMostOnce).unwrap();
        client.ingest("bin", Payload::from_bytes(vec![0xfe, 0xff]), QoS::AtMostOnce, false);
        let latest = client.latest("bin").unwrap();
        assert!(latest.payload.is_lossy());
        assert_eq!(latest.payload.raw().len(), 2);
    }

    #[tokio::test]
    async fn failed_handshake_keeps_single_handle_across_reconnects() {
        let client = SessionClient::ephemeral(unreachable(1));
        assert!(client.connect().await.is_err());
        assert_eq!(client.live_handles(), 1);
        assert!(!client.is_connected());

        // second connect while the loop is retrying must not open a new link
        let _ = client.connect().await;
        assert_eq!(client.live_handles(), 1);

        for port in [2, 3, 4] {
            let _ = client.reconnect(unreachable(port)).await;
            assert_eq!(client.live_handles(), 1);
            assert_eq!(client.descriptor().port, port);
        }

        client.stop().await;
        assert_eq!(client.live_handles(), 0);
        assert_eq!(client.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn environment_switch_clears_history_and_keeps_subscriptions() {
        let client = SessionClient::ephemeral(unreachable(1));
        client
            .subscribe_many(["module/v1/ff/+/state"], QoS::AtLeastOnce)
            .unwrap();
        for i in 0..50 {
            client.ingest("module/v1/ff/SVR3QA0022/state", state_payload(i), QoS::AtLeastOnce, false);
        }
        assert_eq!(client.get_buffer("module/v1/ff/+/state").len(), 50);

        let mut states = client.subscribe_state();
        let _ = client.reconnect(unreachable(5)).await;
        assert!(states.has_changed().unwrap());
        assert_ne!(*states.borrow_and_update(), ConnectionState::Stopped);

        assert!(client.get_buffer("module/v1/ff/+/state").is_empty());
        assert_eq!(client.subscriptions(), vec!["module/v1/ff/+/state".to_string()]);

        client.ingest("module/v1/ff/SVR4H73275/state", state_payload(99), QoS::AtLeastOnce, false);
        assert_eq!(client.get_buffer("module/v1/ff/+/state").len(), 1);
        client.stop().await;
    }

    #[test]
    fn recording_captures_matching_inbound_messages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.jsonl");
        let client = SessionClient::ephemeral(unreachable(1));
        client
            .start_recording(&path, "module/#", &RecorderConfig::default())
            .unwrap();

        client.ingest("module/v1/ff/A/state", state_payload(1), QoS::AtLeastOnce, false);
        client.ingest("ccu/state", state_payload(2), QoS::AtLeastOnce, false);

        let status = client.stop_recording().unwrap();
        assert_eq!(status.written, 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(client.subscriptions().is_empty());
    }

    #[test]
    fn recording_captures_outbound_publishes_with_their_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbound.jsonl");
        let client = SessionClient::ephemeral(unreachable(1));
        client
            .start_recording(&path, "module/#", &RecorderConfig::default())
            .unwrap();

        // Outside the filter on purpose: outbound traffic is always kept.
        client.record_outbound(
            "ccu/order/request",
            state_payload(7),
            QoS::ExactlyOnce,
            false,
            42,
        );

        let status = client.stop_recording().unwrap();
        assert_eq!(status.written, 1);
        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value =
            serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["direction"], "out");
        assert_eq!(line["mid"], 42);
        assert_eq!(line["topic"], "ccu/order/request");
        assert_eq!(line["qos"], 2);
        assert_eq!(line["retain"], false);
    }

    #[tokio::test]
    async fn queued_publish_without_connection_fails_and_counts() {
        let client = SessionClient::ephemeral(unreachable(1));
        let result = client
            .publish_awaiting("ccu/set/park", Payload::from_text("{}"), QoS::AtLeastOnce, false)
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert_eq!(client.status().publish_failures, 1);
    }

    #[test]
    fn shared_accessor_returns_one_instance() {
        let config = AppConfig::default();
        let a = SessionClient::shared(&config);
        let b = SessionClient::shared(&config);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
