//! Session lifecycle for one server endpoint.
//!
//! [`ConnectionManager`] opens both channels through a [`Connector`], runs
//! one read loop per channel, owns the write serializers, and re-establishes
//! the session with exponential backoff when a channel fails. State changes
//! are broadcast via a [`watch`] channel so any number of consumers can
//! react without polling.
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► Reconnecting ─► Connecting ─► ...
//!       ▲                            │              │
//!       └──────── close(false) ──────┴── retries ───┘
//!                                        exhausted
//! ```
//!
//! Every session carries a generation number. Read-loop failures and
//! connect results that belong to an older generation are ignored, so a
//! session that loses both channels at once reconnects only once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::correlator::{
    CorrelationKey, Correlator, DEFAULT_REQUEST_TIMEOUT, KeyTag, RequestError,
};
use crate::diagnostics::{DEFAULT_EVENT_CAPACITY, DebugEvent, Diagnostics, MetricsSnapshot};
use crate::dispatch::{DispatchRegistry, SubscriptionId};
use crate::framing::{
    ChannelKind, DEFAULT_MAX_STREAM_FRAME, Frame, FrameError, Opcode, StreamReassembler,
    decode_datagram, encode_bounded_stream_frame, encode_datagram,
};
use crate::lock;
use crate::payload::{PayloadError, decode_payload, encode_payload};
use crate::reconnection::{ReconnectConfig, ReconnectState};
use crate::transport::{Connector, DatagramChannel, SessionChannels, StreamReader, is_transient};
use crate::writer::{DatagramSink, StreamSink, WriteError, WriteSerializer, WriteTicket};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and no reconnect pending.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Both channels open.
    Connected,
    /// Session lost; a reconnect attempt is scheduled.
    Reconnecting,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the state. Returns `false` if it was already `state`.
    pub fn set(&self, state: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Invoked once when the manager stops trying to keep the session alive.
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Tunables for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Deadline for each request/response pair. Default: 10 s.
    pub request_timeout: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Largest accepted stream frame. Default: 16 MiB.
    pub max_stream_frame: u32,
    /// Size of the stream read buffer. Default: 8 KiB.
    pub read_buffer_size: usize,
    /// Debug events buffered per subscriber. Default: 200.
    pub debug_event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            max_stream_frame: DEFAULT_MAX_STREAM_FRAME,
            read_buffer_size: 8 * 1024,
            debug_event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

struct ActiveSession {
    generation: u64,
    datagram: WriteSerializer,
    stream: WriteSerializer,
    /// Sending `true` (or dropping) ends both read loops.
    shutdown_tx: watch::Sender<bool>,
}

struct Target {
    address: String,
    port: u16,
    on_close: CloseCallback,
}

struct Backoff {
    state: ReconnectState,
    target: Option<Target>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<C: Connector> {
    connector: C,
    config: ManagerConfig,
    state: ConnectionStateWatch,
    registry: Arc<DispatchRegistry>,
    correlator: Arc<Correlator>,
    diagnostics: Arc<Diagnostics>,
    session: Mutex<Option<ActiveSession>>,
    backoff: Mutex<Backoff>,
    generation: AtomicU64,
}

/// Handle to one server endpoint. Cheap to clone; clones share the session.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a disconnected manager.
    pub fn new(connector: C, config: ManagerConfig) -> Self {
        let diagnostics = Arc::new(Diagnostics::new(config.debug_event_capacity));
        let registry = Arc::new(DispatchRegistry::new(Arc::clone(&diagnostics)));
        let correlator = Correlator::new(config.request_timeout, Arc::clone(&diagnostics));
        let backoff = Backoff {
            state: ReconnectState::new(config.reconnect.clone()),
            target: None,
            timer: None,
        };

        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state: ConnectionStateWatch::new(),
                registry,
                correlator,
                diagnostics,
                session: Mutex::new(None),
                backoff: Mutex::new(backoff),
                generation: AtomicU64::new(0),
            }),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Open a session to `address:port`.
    ///
    /// A live session is closed first, without invoking its close callback.
    /// Returns `true` once both channels are open. On failure a reconnect is
    /// scheduled and `false` is returned; `on_close` runs if reconnection is
    /// eventually abandoned.
    pub async fn connect<F>(&self, address: impl Into<String>, port: u16, on_close: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        {
            let mut backoff = lock(&self.inner.backoff);
            if let Some(timer) = backoff.timer.take() {
                timer.abort();
            }
            backoff.target = Some(Target {
                address: address.into(),
                port,
                on_close: Arc::new(on_close),
            });
        }
        self.inner.establish().await
    }

    /// End the session.
    ///
    /// Pending requests are rejected with [`RequestError::ConnectionLost`].
    /// With `should_reconnect` a reconnect is scheduled (or, when
    /// reconnection is disabled, the close callback fires); a handshake in
    /// flight is abandoned and retried the same way. Without it any
    /// scheduled reconnect is cancelled and the close callback fires once.
    pub fn close(&self, should_reconnect: bool) {
        let inner = &self.inner;
        let handshaking = inner.state.current() == ConnectionState::Connecting;
        let (had_session, _) = inner.teardown_session();

        if should_reconnect {
            // A cancelled handshake schedules nothing itself; an armed timer
            // stays as it is.
            if had_session || handshaking {
                tracing::info!("session closed, reconnecting");
                inner.schedule_reconnect();
            }
            return;
        }

        let (had_timer, on_close) = {
            let mut backoff = lock(&inner.backoff);
            let timer = backoff.timer.take();
            if let Some(timer) = &timer {
                timer.abort();
            }
            backoff.state.reset();
            (
                timer.is_some(),
                backoff.target.as_ref().map(|t| Arc::clone(&t.on_close)),
            )
        };

        let was_active =
            had_session || had_timer || inner.state.current() != ConnectionState::Disconnected;
        if was_active {
            tracing::info!("session closed");
            inner.give_up(on_close);
        }
    }

    // -- sending ------------------------------------------------------------

    /// Send one datagram. No delivery or ordering guarantee.
    pub fn send_fire_and_forget(&self, opcode: Opcode, payload: &[u8]) -> WriteTicket {
        let frame = encode_datagram(opcode, payload);
        self.inner
            .enqueue(ChannelKind::Unreliable, opcode, frame, payload.len())
            .unwrap_or_else(|| WriteTicket::rejected(WriteError::SinkClosed))
    }

    /// Send one frame on the reliable channel, ordered after every frame
    /// already sent through this manager.
    ///
    /// Frames longer than [`ManagerConfig::max_stream_frame`] are rejected
    /// without being queued.
    pub fn send_ordered(&self, opcode: Opcode, payload: &[u8]) -> WriteTicket {
        let frame = match self.inner.stream_frame(opcode, payload) {
            Ok(frame) => frame,
            Err(error) => return WriteTicket::rejected(error.into()),
        };
        self.inner
            .enqueue(ChannelKind::Reliable, opcode, frame, payload.len())
            .unwrap_or_else(|| WriteTicket::rejected(WriteError::SinkClosed))
    }

    /// Encode `message` and send it on the reliable channel.
    pub fn send_message<T: Serialize>(
        &self,
        opcode: Opcode,
        message: &T,
    ) -> Result<WriteTicket, PayloadError> {
        Ok(self.send_ordered(opcode, &encode_payload(message)?))
    }

    /// Send a request on the reliable channel and wait for the next
    /// `response_opcode` frame.
    pub async fn send_request(
        &self,
        request_opcode: Opcode,
        response_opcode: Opcode,
        payload: &[u8],
    ) -> Result<Vec<u8>, RequestError> {
        self.send_correlated(request_opcode, CorrelationKey::kind(response_opcode), payload)
            .await
    }

    /// Like [`send_request`](Self::send_request), matching the response by
    /// `tag`. The response opcode needs an extractor registered through
    /// [`expect_response`](Self::expect_response).
    pub async fn send_keyed_request(
        &self,
        request_opcode: Opcode,
        response_opcode: Opcode,
        tag: KeyTag,
        payload: &[u8],
    ) -> Result<Vec<u8>, RequestError> {
        self.send_correlated(
            request_opcode,
            CorrelationKey::tagged(response_opcode, tag),
            payload,
        )
        .await
    }

    /// Typed request: encodes `request`, decodes the response.
    pub async fn request<Req, Resp>(
        &self,
        request_opcode: Opcode,
        response_opcode: Opcode,
        request: &Req,
    ) -> Result<Resp, RequestError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode_payload(request)?;
        let response = self
            .send_request(request_opcode, response_opcode, &payload)
            .await?;
        Ok(decode_payload(&response)?)
    }

    async fn send_correlated(
        &self,
        request_opcode: Opcode,
        key: CorrelationKey,
        payload: &[u8],
    ) -> Result<Vec<u8>, RequestError> {
        let inner = &self.inner;
        if !inner.is_connected() {
            return Err(RequestError::NotConnected);
        }

        let frame = inner
            .stream_frame(request_opcode, payload)
            .map_err(WriteError::from)?;
        inner.correlator.ensure_attached(&inner.registry, key.opcode);
        let pending = inner.correlator.issue(key);

        let Some(ticket) =
            inner.enqueue(ChannelKind::Reliable, request_opcode, frame, payload.len())
        else {
            pending.withdraw();
            return Err(RequestError::NotConnected);
        };
        if let Err(error) = ticket.await {
            pending.withdraw();
            return Err(error.into());
        }
        pending.wait().await
    }

    // -- registration -------------------------------------------------------

    /// Register the handler for `opcode`, replacing any previous one.
    pub fn on_opcode<T, D, H>(&self, opcode: Opcode, decoder: D, handler: H)
    where
        D: Fn(&[u8]) -> Result<T, PayloadError> + Send + Sync + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        self.inner.registry.register(opcode, decoder, handler);
    }

    /// Register a handler for a postcard-encoded message type.
    pub fn on_message<T, H>(&self, opcode: Opcode, handler: H)
    where
        T: DeserializeOwned + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        self.inner.registry.register_message(opcode, handler);
    }

    /// Register a handler that receives raw payload bytes.
    pub fn on_raw<H>(&self, opcode: Opcode, handler: H)
    where
        H: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.registry.register_raw(opcode, handler);
    }

    /// Add an observer that runs after the primary handler.
    pub fn subscribe<T, D, H>(&self, opcode: Opcode, decoder: D, handler: H) -> SubscriptionId
    where
        D: Fn(&[u8]) -> Result<T, PayloadError> + Send + Sync + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(opcode, decoder, handler)
    }

    /// Remove an observer.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.inner.registry.unsubscribe(subscription)
    }

    /// Remove the primary handler for `opcode`.
    pub fn unregister(&self, opcode: Opcode) -> bool {
        self.inner.registry.unregister(opcode)
    }

    /// Serve `response_opcode` from the correlator, deriving each response's
    /// key with `extractor`.
    pub fn expect_response<E>(&self, response_opcode: Opcode, extractor: E)
    where
        E: Fn(&[u8]) -> Option<KeyTag> + Send + Sync + 'static,
    {
        self.inner
            .correlator
            .attach(&self.inner.registry, response_opcode, Some(Arc::new(extractor)));
    }

    // -- observation --------------------------------------------------------

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether both channels are open.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Subscribe to debug events.
    pub fn debug_events(&self) -> broadcast::Receiver<DebugEvent> {
        self.inner.diagnostics.subscribe()
    }

    /// Snapshot of the transport counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.diagnostics.snapshot()
    }

    /// Requests still waiting for a response.
    pub fn in_flight_requests(&self) -> usize {
        self.inner.correlator.in_flight()
    }

    /// Opcodes with a registered handler.
    pub fn registered_opcodes(&self) -> Vec<Opcode> {
        self.inner.registry.registered_opcodes()
    }
}

impl<C: Connector> Inner<C> {
    fn is_connected(&self) -> bool {
        lock(&self.session).is_some()
    }

    fn stream_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        encode_bounded_stream_frame(opcode, payload, self.config.max_stream_frame)
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state.set(state) {
            tracing::debug!(?state, "connection state changed");
            self.diagnostics.record_state(state);
        }
    }

    /// Handshake with the cached target and start the session.
    async fn establish(self: &Arc<Self>) -> bool {
        let Some((address, port)) = lock(&self.backoff)
            .target
            .as_ref()
            .map(|t| (t.address.clone(), t.port))
        else {
            return false;
        };

        let (had_session, generation) = self.teardown_session();
        if had_session {
            tracing::debug!("replacing live session");
        }
        self.set_state(ConnectionState::Connecting);

        match self.connector.connect(&address, port).await {
            Ok(channels) => {
                if !self.start_session(channels, generation) {
                    tracing::debug!(%address, port, "connect superseded, discarding channels");
                    return false;
                }
                lock(&self.backoff).state.reset();
                self.set_state(ConnectionState::Connected);
                tracing::info!(%address, port, "connected");
                true
            }
            Err(error) => {
                if self.generation.load(Ordering::SeqCst) != generation {
                    return false;
                }
                tracing::warn!(%address, port, %error, "connect failed");
                self.schedule_reconnect();
                false
            }
        }
    }

    /// Install a session for `generation` unless a close or newer connect
    /// happened while the handshake was running.
    fn start_session(
        self: &Arc<Self>,
        channels: SessionChannels<C::Datagram>,
        generation: u64,
    ) -> bool {
        let mut session = lock(&self.session);
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }

        let SessionChannels {
            datagram,
            reader,
            writer,
        } = channels;
        let datagram = Arc::new(datagram);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let datagram_writer =
            WriteSerializer::spawn(DatagramSink(Arc::clone(&datagram)), ChannelKind::Unreliable);
        let stream_writer = WriteSerializer::spawn(StreamSink(writer), ChannelKind::Reliable);

        tokio::spawn(read_datagrams(
            datagram,
            self.read_context(generation),
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_stream(
            reader,
            self.read_context(generation),
            shutdown_rx,
            self.config.max_stream_frame,
            self.config.read_buffer_size,
        ));

        *session = Some(ActiveSession {
            generation,
            datagram: datagram_writer,
            stream: stream_writer,
            shutdown_tx,
        });
        true
    }

    fn read_context(self: &Arc<Self>, generation: u64) -> ReadContext<C> {
        ReadContext {
            generation,
            registry: Arc::clone(&self.registry),
            diagnostics: Arc::clone(&self.diagnostics),
            manager: Arc::downgrade(self),
        }
    }

    /// Drop the live session (if any) and reject pending requests. Returns
    /// whether a session existed and the new generation.
    fn teardown_session(&self) -> (bool, u64) {
        let (session, generation) = {
            let mut session = lock(&self.session);
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (session.take(), generation)
        };
        let had_session = session.is_some();
        self.release(session);
        (had_session, generation)
    }

    fn release(&self, session: Option<ActiveSession>) {
        if let Some(session) = session {
            let _ = session.shutdown_tx.send(true);
        }
        self.correlator.fail_all();
    }

    fn enqueue(
        &self,
        channel: ChannelKind,
        opcode: Opcode,
        frame: Vec<u8>,
        len: usize,
    ) -> Option<WriteTicket> {
        let ticket = {
            let session = lock(&self.session);
            let active = session.as_ref()?;
            match channel {
                ChannelKind::Unreliable => active.datagram.enqueue(frame),
                ChannelKind::Reliable => active.stream.enqueue(frame),
            }
        };
        self.diagnostics.record_sent(channel, opcode, len);
        Some(ticket)
    }

    /// A read loop ended. Only the first failure of the current session acts.
    fn on_channel_failure(self: &Arc<Self>, generation: u64, channel: ChannelKind, reason: &str) {
        let session = {
            let mut session = lock(&self.session);
            match session.as_ref() {
                Some(active) if active.generation == generation => {}
                _ => return,
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            session.take()
        };
        tracing::warn!(%channel, %reason, "channel failed, closing session");
        self.release(session);
        self.schedule_reconnect();
    }

    /// Arm the next reconnect attempt, or give up once the budget is spent.
    fn schedule_reconnect(self: &Arc<Self>) {
        let mut backoff = lock(&self.backoff);
        if let Some(timer) = backoff.timer.take() {
            timer.abort();
        }

        let delay = if self.config.reconnect.enabled && backoff.target.is_some() {
            backoff.state.next_delay()
        } else {
            None
        };
        let Some(delay) = delay else {
            let attempts = backoff.state.attempts();
            backoff.state.reset();
            let on_close = backoff.target.as_ref().map(|t| Arc::clone(&t.on_close));
            drop(backoff);
            tracing::warn!(attempts, "giving up on reconnection");
            self.give_up(on_close);
            return;
        };

        let attempt = backoff.state.attempts();
        self.diagnostics.record_reconnect_attempt();
        self.set_state(ConnectionState::Reconnecting);
        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let manager = Arc::downgrade(self);
        backoff.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = manager.upgrade() else {
                return;
            };
            {
                let mut backoff = lock(&inner.backoff);
                let current = backoff
                    .timer
                    .as_ref()
                    .is_some_and(|timer| timer.id() == tokio::task::id());
                if !current {
                    return;
                }
                backoff.timer = None;
            }
            // A failure here schedules the next attempt itself.
            inner.establish().await;
        }));
    }

    fn give_up(&self, on_close: Option<CloseCallback>) {
        self.set_state(ConnectionState::Disconnected);
        if let Some(on_close) = on_close {
            on_close();
        }
    }
}

impl<C: Connector> Drop for Inner<C> {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            let _ = session.shutdown_tx.send(true);
        }
        let backoff = self.backoff.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = backoff.timer.take() {
            timer.abort();
        }
    }
}

/// What a read loop needs from its manager without keeping it alive.
struct ReadContext<C: Connector> {
    generation: u64,
    registry: Arc<DispatchRegistry>,
    diagnostics: Arc<Diagnostics>,
    manager: Weak<Inner<C>>,
}

impl<C: Connector> ReadContext<C> {
    fn deliver(&self, frame: Frame, channel: ChannelKind) {
        self.diagnostics
            .record_received(channel, frame.opcode, frame.payload.len());
        self.registry.dispatch(frame.opcode, &frame.payload, channel);
    }

    fn failed(&self, channel: ChannelKind, reason: &str) {
        if let Some(inner) = self.manager.upgrade() {
            inner.on_channel_failure(self.generation, channel, reason);
        }
    }
}

async fn read_datagrams<C: Connector>(
    datagram: Arc<C::Datagram>,
    context: ReadContext<C>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let channel = ChannelKind::Unreliable;
    let reason = loop {
        tokio::select! {
            result = datagram.recv() => match result {
                Ok(bytes) => match decode_datagram(&bytes) {
                    Ok(frame) => context.deliver(frame, channel),
                    Err(error) => context.diagnostics.record_decode_failure(channel, None, &error),
                },
                Err(error) if is_transient(&error) => {
                    context.diagnostics.record_transient_error(channel, &error);
                }
                Err(error) => break error.to_string(),
            },
            _ = shutdown_rx.changed() => return,
        }
    };
    context.failed(channel, &reason);
}

async fn read_stream<C: Connector>(
    mut reader: StreamReader,
    context: ReadContext<C>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame: u32,
    buffer_size: usize,
) {
    let channel = ChannelKind::Reliable;
    let mut reassembler = StreamReassembler::new(max_frame);
    let mut buf = vec![0u8; buffer_size.max(1)];

    let reason = loop {
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break "end of stream".to_string(),
                Ok(n) => match reassembler.push(&buf[..n]) {
                    Ok(frames) => {
                        for frame in frames {
                            context.deliver(frame, channel);
                        }
                    }
                    // The stream cannot be resynchronised after a bad header.
                    Err(error) => {
                        context.diagnostics.record_decode_failure(channel, None, &error);
                        break error.to_string();
                    }
                },
                Err(error) => break error.to_string(),
            },
            _ = shutdown_rx.changed() => return,
        }
    };
    context.failed(channel, &reason);
}
