//! Transport diagnostics: lifetime counters and a debug event bus.
//!
//! Failures that are recovered locally (undecodable payloads, responses that
//! match no pending request, unknown opcodes) never reach application code as
//! errors. They are counted here and published as [`DebugEvent`]s so a debug
//! panel or a test can observe them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::broadcast;

use crate::connection::ConnectionState;
use crate::framing::{ChannelKind, Opcode};

/// Default number of debug events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 200;

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEventKind {
    /// The connection state changed.
    State(ConnectionState),
    /// A frame was handed to a write queue.
    Sent {
        /// Channel used.
        channel: ChannelKind,
        /// Message kind.
        opcode: Opcode,
        /// Payload length in bytes.
        len: usize,
    },
    /// A frame was decoded from a channel.
    Received {
        /// Channel it arrived on.
        channel: ChannelKind,
        /// Message kind.
        opcode: Opcode,
        /// Payload length in bytes.
        len: usize,
    },
    /// A registered decoder rejected a payload, or a datagram was malformed.
    DecodeFailed {
        /// Channel it arrived on.
        channel: ChannelKind,
        /// Message kind, if one could be read.
        opcode: Option<Opcode>,
        /// Decoder error text.
        error: String,
    },
    /// A handler panicked.
    HandlerPanicked {
        /// Channel it arrived on.
        channel: ChannelKind,
        /// Message kind.
        opcode: Opcode,
        /// Panic message, when it was a string.
        message: String,
    },
    /// A response arrived that matched no pending request.
    CorrelationMiss {
        /// Response opcode.
        opcode: Opcode,
        /// Derived key, rendered for display.
        key: String,
    },
    /// A pending request ran out of time.
    RequestTimedOut {
        /// Response opcode that never arrived.
        opcode: Opcode,
    },
    /// A channel reported an error it can recover from, such as an ICMP
    /// port-unreachable surfacing on the datagram socket.
    TransientError {
        /// Channel that reported it.
        channel: ChannelKind,
        /// Error text.
        error: String,
    },
}

/// A timestamped debug event.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugEvent {
    /// Wall-clock time the event was recorded.
    pub at: SystemTime,
    /// Event payload.
    pub kind: DebugEventKind,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Datagram frames written.
    pub datagrams_sent: u64,
    /// Datagram frames received.
    pub datagrams_received: u64,
    /// Stream frames written.
    pub stream_frames_sent: u64,
    /// Stream frames received.
    pub stream_frames_received: u64,
    /// Frames dropped because no handler was registered.
    pub unknown_opcodes: u64,
    /// Payloads or datagrams that failed to decode.
    pub decode_failures: u64,
    /// Handlers that panicked.
    pub handler_panics: u64,
    /// Responses that matched no pending request.
    pub correlation_misses: u64,
    /// Requests rejected by timeout.
    pub request_timeouts: u64,
    /// Reconnect attempts scheduled.
    pub reconnect_attempts: u64,
    /// Recoverable channel errors that did not end the session.
    pub transient_errors: u64,
}

#[derive(Default)]
struct Counters {
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    stream_frames_sent: AtomicU64,
    stream_frames_received: AtomicU64,
    unknown_opcodes: AtomicU64,
    decode_failures: AtomicU64,
    handler_panics: AtomicU64,
    correlation_misses: AtomicU64,
    request_timeouts: AtomicU64,
    reconnect_attempts: AtomicU64,
    transient_errors: AtomicU64,
}

/// Shared counters plus the debug event broadcaster.
pub struct Diagnostics {
    counters: Counters,
    events: broadcast::Sender<DebugEvent>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl Diagnostics {
    /// Create diagnostics whose event bus buffers `capacity` events per
    /// subscriber. Slow subscribers lose the oldest events.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            counters: Counters::default(),
            events,
        }
    }

    /// Subscribe to debug events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.events.subscribe()
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        MetricsSnapshot {
            datagrams_sent: c.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: c.datagrams_received.load(Ordering::Relaxed),
            stream_frames_sent: c.stream_frames_sent.load(Ordering::Relaxed),
            stream_frames_received: c.stream_frames_received.load(Ordering::Relaxed),
            unknown_opcodes: c.unknown_opcodes.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            handler_panics: c.handler_panics.load(Ordering::Relaxed),
            correlation_misses: c.correlation_misses.load(Ordering::Relaxed),
            request_timeouts: c.request_timeouts.load(Ordering::Relaxed),
            reconnect_attempts: c.reconnect_attempts.load(Ordering::Relaxed),
            transient_errors: c.transient_errors.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, kind: DebugEventKind) {
        // No subscribers is the common case outside of tooling.
        let _ = self.events.send(DebugEvent {
            at: SystemTime::now(),
            kind,
        });
    }

    pub(crate) fn record_state(&self, state: ConnectionState) {
        self.publish(DebugEventKind::State(state));
    }

    pub(crate) fn record_sent(&self, channel: ChannelKind, opcode: Opcode, len: usize) {
        let counter = match channel {
            ChannelKind::Unreliable => &self.counters.datagrams_sent,
            ChannelKind::Reliable => &self.counters.stream_frames_sent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.publish(DebugEventKind::Sent {
            channel,
            opcode,
            len,
        });
    }

    pub(crate) fn record_received(&self, channel: ChannelKind, opcode: Opcode, len: usize) {
        let counter = match channel {
            ChannelKind::Unreliable => &self.counters.datagrams_received,
            ChannelKind::Reliable => &self.counters.stream_frames_received,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.publish(DebugEventKind::Received {
            channel,
            opcode,
            len,
        });
    }

    pub(crate) fn record_unknown_opcode(&self, channel: ChannelKind, opcode: Opcode) {
        self.counters.unknown_opcodes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(opcode, %channel, "no handler registered, dropping frame");
    }

    pub(crate) fn record_decode_failure(
        &self,
        channel: ChannelKind,
        opcode: Option<Opcode>,
        error: &dyn std::fmt::Display,
    ) {
        self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(?opcode, %channel, %error, "failed to decode frame");
        self.publish(DebugEventKind::DecodeFailed {
            channel,
            opcode,
            error: error.to_string(),
        });
    }

    pub(crate) fn record_handler_panic(
        &self,
        channel: ChannelKind,
        opcode: Opcode,
        message: String,
    ) {
        self.counters.handler_panics.fetch_add(1, Ordering::Relaxed);
        tracing::error!(opcode, %channel, %message, "handler panicked");
        self.publish(DebugEventKind::HandlerPanicked {
            channel,
            opcode,
            message,
        });
    }

    pub(crate) fn record_correlation_miss(&self, opcode: Opcode, key: String) {
        self.counters
            .correlation_misses
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(opcode, %key, "response matched no pending request");
        self.publish(DebugEventKind::CorrelationMiss { opcode, key });
    }

    pub(crate) fn record_request_timeout(&self, opcode: Opcode) {
        self.counters.request_timeouts.fetch_add(1, Ordering::Relaxed);
        self.publish(DebugEventKind::RequestTimedOut { opcode });
    }

    pub(crate) fn record_reconnect_attempt(&self) {
        self.counters
            .reconnect_attempts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transient_error(&self, channel: ChannelKind, error: &std::io::Error) {
        self.counters.transient_errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%channel, %error, "ignoring recoverable channel error");
        self.publish(DebugEventKind::TransientError {
            channel,
            error: error.to_string(),
        });
    }
}
