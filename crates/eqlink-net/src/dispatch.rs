//! Opcode dispatch: route decoded frames to registered handlers.
//!
//! Each opcode has at most one primary handler; registering again replaces
//! it. Features that only need to observe a message kind can
//! [`subscribe`](DispatchRegistry::subscribe) instead, which appends to an
//! ordered list that `register` never touches.
//!
//! Every invocation runs inside a failure boundary: decode errors and handler
//! panics are recorded in [`Diagnostics`] and never reach the read loop.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;

use crate::diagnostics::Diagnostics;
use crate::framing::{ChannelKind, Opcode};
use crate::lock;
use crate::payload::{PayloadError, decode_payload};

/// Type-erased decode+invoke callback.
type Handler = Arc<dyn Fn(&[u8]) -> Result<(), PayloadError> + Send + Sync>;

/// Handle returned by [`DispatchRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    opcode: Opcode,
    id: u64,
}

impl SubscriptionId {
    /// The opcode this subscription observes.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }
}

#[derive(Default)]
struct Route {
    primary: Option<Handler>,
    subscribers: Vec<(u64, Handler)>,
}

impl Route {
    fn is_empty(&self) -> bool {
        self.primary.is_none() && self.subscribers.is_empty()
    }
}

/// Routes incoming frames to handlers by opcode.
pub struct DispatchRegistry {
    routes: Mutex<HashMap<Opcode, Route>>,
    next_subscription: AtomicU64,
    diagnostics: Arc<Diagnostics>,
}

fn erase<T, D, H>(decoder: D, handler: H) -> Handler
where
    D: Fn(&[u8]) -> Result<T, PayloadError> + Send + Sync + 'static,
    H: Fn(T) + Send + Sync + 'static,
{
    Arc::new(move |payload: &[u8]| {
        let value = decoder(payload)?;
        handler(value);
        Ok(())
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl DispatchRegistry {
    /// Create an empty registry reporting into `diagnostics`.
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            diagnostics,
        }
    }

    /// Register the primary handler for `opcode`, replacing any previous one.
    ///
    /// `decoder` turns the payload into a `T`; `handler` receives it.
    pub fn register<T, D, H>(&self, opcode: Opcode, decoder: D, handler: H)
    where
        D: Fn(&[u8]) -> Result<T, PayloadError> + Send + Sync + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        self.install(opcode, erase(decoder, handler));
    }

    /// Register a primary handler that receives the raw payload bytes.
    pub fn register_raw<H>(&self, opcode: Opcode, handler: H)
    where
        H: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.install(
            opcode,
            Arc::new(move |payload: &[u8]| {
                handler(payload);
                Ok(())
            }),
        );
    }

    /// Register a primary handler for a postcard-encoded message type.
    pub fn register_message<T, H>(&self, opcode: Opcode, handler: H)
    where
        T: DeserializeOwned + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        self.register(opcode, decode_payload::<T>, handler);
    }

    fn install(&self, opcode: Opcode, handler: Handler) {
        let replaced = lock(&self.routes)
            .entry(opcode)
            .or_default()
            .primary
            .replace(handler)
            .is_some();
        if replaced {
            tracing::debug!(opcode, "replaced existing handler");
        }
    }

    /// Remove the primary handler for `opcode`. Subscribers are kept.
    pub fn unregister(&self, opcode: Opcode) -> bool {
        let mut routes = lock(&self.routes);
        let Some(route) = routes.get_mut(&opcode) else {
            return false;
        };
        let removed = route.primary.take().is_some();
        if route.is_empty() {
            routes.remove(&opcode);
        }
        removed
    }

    /// Add an observer for `opcode`. Observers run after the primary
    /// handler, in subscription order.
    pub fn subscribe<T, D, H>(&self, opcode: Opcode, decoder: D, handler: H) -> SubscriptionId
    where
        D: Fn(&[u8]) -> Result<T, PayloadError> + Send + Sync + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.routes)
            .entry(opcode)
            .or_default()
            .subscribers
            .push((id, erase(decoder, handler)));
        SubscriptionId { opcode, id }
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut routes = lock(&self.routes);
        let Some(route) = routes.get_mut(&subscription.opcode) else {
            return false;
        };
        let before = route.subscribers.len();
        route.subscribers.retain(|(id, _)| *id != subscription.id);
        let removed = route.subscribers.len() != before;
        if route.is_empty() {
            routes.remove(&subscription.opcode);
        }
        removed
    }

    /// Whether anything will receive frames for `opcode`.
    pub fn is_registered(&self, opcode: Opcode) -> bool {
        lock(&self.routes).contains_key(&opcode)
    }

    /// Opcodes with at least one handler (useful for startup logging).
    pub fn registered_opcodes(&self) -> Vec<Opcode> {
        let mut opcodes: Vec<Opcode> = lock(&self.routes).keys().copied().collect();
        opcodes.sort_unstable();
        opcodes
    }

    /// Route one frame.
    ///
    /// Returns `false` when nothing is registered for `opcode`; the frame is
    /// dropped. Handlers run without the registry lock held, so they may
    /// register or unregister freely.
    pub fn dispatch(&self, opcode: Opcode, payload: &[u8], channel: ChannelKind) -> bool {
        let handlers: Vec<Handler> = {
            let routes = lock(&self.routes);
            let Some(route) = routes.get(&opcode) else {
                self.diagnostics.record_unknown_opcode(channel, opcode);
                return false;
            };
            route
                .primary
                .iter()
                .cloned()
                .chain(route.subscribers.iter().map(|(_, h)| Arc::clone(h)))
                .collect()
        };

        for handler in &handlers {
            self.invoke(handler, opcode, payload, channel);
        }
        true
    }

    fn invoke(&self, handler: &Handler, opcode: Opcode, payload: &[u8], channel: ChannelKind) {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                self.diagnostics
                    .record_decode_failure(channel, Some(opcode), &error);
            }
            Err(panic) => {
                self.diagnostics
                    .record_handler_panic(channel, opcode, panic_message(panic.as_ref()));
            }
        }
    }
}
