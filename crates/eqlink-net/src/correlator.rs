//! Request/response correlation.
//!
//! Turns fire-and-forget dispatch into awaitable calls. Each request leaves a
//! waiter in a table keyed by [`CorrelationKey`]; the correlator registers
//! itself as the dispatch handler of every response opcode it serves and
//! settles waiters as responses arrive.
//!
//! ```text
//!  issue() ──► pending[key] ◄── response frame (key derived from payload)
//!                 │
//!        ┌────────┼──────────────┐
//!     resolve   timeout     connection lost
//! ```
//!
//! Every waiter settles exactly once: whichever path removes it from the
//! table under the lock owns the outcome.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::diagnostics::Diagnostics;
use crate::dispatch::DispatchRegistry;
use crate::framing::Opcode;
use crate::lock;
use crate::payload::PayloadError;
use crate::writer::WriteError;

/// Default deadline for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifying part of a correlation key, echoed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyTag {
    /// The response opcode alone identifies the request.
    Kind,
    /// A numeric id echoed in the response.
    Id(u64),
    /// A textual id (e.g. a character name) echoed in the response.
    Name(String),
}

/// Key matching a response to the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Response opcode.
    pub opcode: Opcode,
    /// Identifying field.
    pub tag: KeyTag,
}

impl CorrelationKey {
    /// Key on the response opcode alone.
    pub fn kind(opcode: Opcode) -> Self {
        Self {
            opcode,
            tag: KeyTag::Kind,
        }
    }

    /// Key on the response opcode plus an identifying field.
    pub fn tagged(opcode: Opcode, tag: KeyTag) -> Self {
        Self { opcode, tag }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            KeyTag::Kind => write!(f, "{}", self.opcode),
            KeyTag::Id(id) => write!(f, "{}#{id}", self.opcode),
            KeyTag::Name(name) => write!(f, "{}#{name}", self.opcode),
        }
    }
}

/// Derives the [`KeyTag`] from a response payload. `None` means the
/// payload carried no usable key.
pub type KeyExtractor = Arc<dyn Fn(&[u8]) -> Option<KeyTag> + Send + Sync>;

/// Reasons a request did not produce a response.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// No session is open.
    #[error("not connected")]
    NotConnected,

    /// No matching response arrived in time.
    #[error("request timed out waiting for opcode {opcode} after {after:?}")]
    Timeout {
        /// Response opcode that never arrived.
        opcode: Opcode,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The session ended while the request was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// The request frame could not be written.
    #[error("failed to send request: {0}")]
    Write(#[from] WriteError),

    /// The request could not be encoded or the response decoded.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

type Outcome = Result<Vec<u8>, RequestError>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Outcome>,
    timer: AbortHandle,
}

/// Table of in-flight requests.
pub struct Correlator {
    pending: Mutex<HashMap<CorrelationKey, VecDeque<Waiter>>>,
    extractors: Mutex<HashMap<Opcode, KeyExtractor>>,
    attached: Mutex<HashSet<Opcode>>,
    next_id: AtomicU64,
    timeout: Duration,
    diagnostics: Arc<Diagnostics>,
}

impl Correlator {
    /// Create a correlator whose requests expire after `timeout`.
    pub fn new(timeout: Duration, diagnostics: Arc<Diagnostics>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            extractors: Mutex::new(HashMap::new()),
            attached: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            timeout,
            diagnostics,
        })
    }

    /// Claim `response_opcode` in `registry`, deriving keys with `extractor`
    /// (or the opcode alone when `None`). Replaces any handler registered
    /// for that opcode.
    pub fn attach(
        self: &Arc<Self>,
        registry: &DispatchRegistry,
        response_opcode: Opcode,
        extractor: Option<KeyExtractor>,
    ) {
        {
            let mut extractors = lock(&self.extractors);
            match extractor {
                Some(extractor) => extractors.insert(response_opcode, extractor),
                None => extractors.remove(&response_opcode),
            };
        }

        let correlator: Weak<Self> = Arc::downgrade(self);
        registry.register_raw(response_opcode, move |payload| {
            if let Some(correlator) = correlator.upgrade() {
                correlator.complete(response_opcode, payload);
            }
        });
        lock(&self.attached).insert(response_opcode);
        tracing::debug!(opcode = response_opcode, "correlator attached");
    }

    /// Attach with the default key if this opcode is not served yet.
    pub fn ensure_attached(self: &Arc<Self>, registry: &DispatchRegistry, response_opcode: Opcode) {
        let attached = lock(&self.attached).contains(&response_opcode);
        if !attached || !registry.is_registered(response_opcode) {
            let extractor = lock(&self.extractors).get(&response_opcode).cloned();
            self.attach(registry, response_opcode, extractor);
        }
    }

    /// Register a waiter for `key` and start its timer.
    ///
    /// Must be called before the request frame is written so a fast
    /// response cannot slip past. Requires a tokio runtime.
    pub fn issue(self: &Arc<Self>, key: CorrelationKey) -> PendingResponse {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let weak = Arc::downgrade(self);
        let timer_key = key.clone();
        let timeout = self.timeout;

        let mut pending = lock(&self.pending);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = weak.upgrade() {
                correlator.expire(&timer_key, id);
            }
        })
        .abort_handle();
        pending
            .entry(key.clone())
            .or_default()
            .push_back(Waiter { id, tx, timer });
        drop(pending);

        tracing::trace!(%key, id, "request issued");
        PendingResponse {
            rx: Some(rx),
            key,
            id,
            correlator: Arc::downgrade(self),
        }
    }

    /// Settle the oldest waiter for the key derived from `payload`.
    fn complete(&self, opcode: Opcode, payload: &[u8]) {
        let extractor = lock(&self.extractors).get(&opcode).cloned();
        let tag = match extractor {
            Some(extract) => match extract(payload) {
                Some(tag) => tag,
                None => {
                    self.diagnostics
                        .record_correlation_miss(opcode, format!("{opcode}#<no key>"));
                    return;
                }
            },
            None => KeyTag::Kind,
        };
        let key = CorrelationKey::tagged(opcode, tag);

        let mut pending = lock(&self.pending);
        let Some(queue) = pending.get_mut(&key) else {
            self.diagnostics.record_correlation_miss(opcode, key.to_string());
            return;
        };

        let mut delivered = false;
        while let Some(waiter) = queue.pop_front() {
            waiter.timer.abort();
            if waiter.tx.send(Ok(payload.to_vec())).is_ok() {
                delivered = true;
                break;
            }
        }
        if queue.is_empty() {
            pending.remove(&key);
        }
        drop(pending);

        if !delivered {
            self.diagnostics.record_correlation_miss(opcode, key.to_string());
        }
    }

    fn expire(&self, key: &CorrelationKey, id: u64) {
        let Some(waiter) = self.take(key, id) else {
            return;
        };
        tracing::warn!(%key, after = ?self.timeout, "request timed out");
        self.diagnostics.record_request_timeout(key.opcode);
        let _ = waiter.tx.send(Err(RequestError::Timeout {
            opcode: key.opcode,
            after: self.timeout,
        }));
    }

    fn take(&self, key: &CorrelationKey, id: u64) -> Option<Waiter> {
        let mut pending = lock(&self.pending);
        let queue = pending.get_mut(key)?;
        let position = queue.iter().position(|w| w.id == id)?;
        let waiter = queue.remove(position);
        if queue.is_empty() {
            pending.remove(key);
        }
        waiter
    }

    /// Reject every pending request with [`RequestError::ConnectionLost`]
    /// and clear the table. Returns how many were rejected.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Waiter> = lock(&self.pending)
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect();

        let count = drained.len();
        for waiter in drained {
            waiter.timer.abort();
            let _ = waiter.tx.send(Err(RequestError::ConnectionLost));
        }
        if count > 0 {
            tracing::info!(count, "rejected pending requests after connection loss");
        }
        count
    }

    /// Number of requests still waiting.
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).values().map(VecDeque::len).sum()
    }
}

/// A request's eventual response.
///
/// Dropping it without awaiting withdraws the waiter.
pub struct PendingResponse {
    rx: Option<oneshot::Receiver<Outcome>>,
    key: CorrelationKey,
    id: u64,
    correlator: Weak<Correlator>,
}

impl PendingResponse {
    /// The key this response will be matched on.
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Wait for the response payload.
    pub async fn wait(mut self) -> Result<Vec<u8>, RequestError> {
        match self.rx.take() {
            Some(rx) => rx.await.unwrap_or(Err(RequestError::ConnectionLost)),
            None => Err(RequestError::ConnectionLost),
        }
    }

    /// Remove the waiter without settling it (the request was never sent).
    pub fn withdraw(self) {
        drop(self);
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(correlator) = self.correlator.upgrade()
            && let Some(waiter) = correlator.take(&self.key, self.id)
        {
            waiter.timer.abort();
        }
    }
}
