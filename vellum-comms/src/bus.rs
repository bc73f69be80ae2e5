//! In-process publish/subscribe message bus.
//!
//! The bus is the only transport in the system: clients and the document
//! manager never hold references to each other, they only share a bus and a
//! set of address strings. Routing is deliberately simple:
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!    publish ──────► │  duplicate check (identity)  │
//!                    │  recipient snapshot          │──► handlers (outside lock)
//!                    │  routes ∪ wildcard           │
//!                    └──────────────────────────────┘
//! ```
//!
//! Delivery rules:
//! - Addressed envelopes reach subscribers at that address plus wildcard
//!   subscribers; broadcasts reach everyone.
//! - A handler subscribed several times (same `Arc`) still runs once per
//!   envelope.
//! - Re-publishing the same `Arc<Envelope>` is a no-op. Identity is the
//!   `Arc` allocation, not the content, so an equal-but-distinct envelope is
//!   delivered normally.
//!
//! Handlers run synchronously on the publisher's stack once the internal lock
//! has been released, so a handler may publish or subscribe reentrantly but
//! must not block. With [`MessageBus::with_latency`] delivery is instead
//! deferred onto a spawned task, which makes ordering across publishes
//! unspecified; the recipient set is still snapshotted at publish time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::message::{Address, Envelope};

/// Handler invoked for every envelope delivered to a subscription.
pub type Handler<T> = Arc<dyn Fn(&Arc<Envelope<T>>) + Send + Sync>;

/// Prune dead duplicate-tracking entries once the table reaches this size.
const SEEN_PRUNE_THRESHOLD: usize = 512;

struct Route<T> {
    id: u64,
    handler: Handler<T>,
}

struct BusState<T> {
    routes: HashMap<Address, Vec<Route<T>>>,
    wildcard: Vec<Route<T>>,
    /// Envelopes already delivered, keyed by `Arc` allocation address. The
    /// stored `Weak` keeps the allocation pinned, so a key cannot be reused
    /// by a new envelope while its entry is live.
    seen: HashMap<usize, Weak<Envelope<T>>>,
    next_route: u64,
    destroyed: bool,
}

struct BusInner<T> {
    state: Mutex<BusState<T>>,
    latency: Option<Duration>,
}

impl<T> BusInner<T> {
    fn state(&self) -> MutexGuard<'_, BusState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle to a shared bus.
pub struct MessageBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for MessageBus<T> {
    fn clone(&self) -> Self {
        MessageBus {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> MessageBus<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A bus that defers every delivery by a fixed interval. Used to shake
    /// out timing assumptions in tests; requires a tokio runtime.
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(Some(latency))
    }

    fn build(latency: Option<Duration>) -> Self {
        MessageBus {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    routes: HashMap::new(),
                    wildcard: Vec::new(),
                    seen: HashMap::new(),
                    next_route: 0,
                    destroyed: false,
                }),
                latency,
            }),
        }
    }

    /// Subscribe `handler` to envelopes addressed to `address` (plus all
    /// broadcasts). The subscription ends when the returned guard is dropped.
    #[must_use = "dropping the subscription unsubscribes the handler"]
    pub fn subscribe(&self, address: impl Into<Address>, handler: Handler<T>) -> Subscription<T> {
        let address = address.into();
        let mut state = self.inner.state();
        if state.destroyed {
            return Subscription::inert();
        }
        let id = state.next_route;
        state.next_route += 1;
        state
            .routes
            .entry(address.clone())
            .or_default()
            .push(Route { id, handler });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            key: Some(SubscriptionKey::At(address, id)),
        }
    }

    /// Subscribe to every envelope on the bus regardless of address.
    #[must_use = "dropping the subscription unsubscribes the handler"]
    pub fn subscribe_any(&self, handler: Handler<T>) -> Subscription<T> {
        let mut state = self.inner.state();
        if state.destroyed {
            return Subscription::inert();
        }
        let id = state.next_route;
        state.next_route += 1;
        state.wildcard.push(Route { id, handler });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            key: Some(SubscriptionKey::Wildcard(id)),
        }
    }

    /// Publish an envelope. Duplicate instances are suppressed; the recipient
    /// set is computed here even when delivery itself is deferred by latency.
    pub fn publish(&self, envelope: Arc<Envelope<T>>) {
        let recipients = {
            let mut state = self.inner.state();
            if state.destroyed {
                return;
            }
            if !remember(&mut state, &envelope) {
                log::debug!("suppressing duplicate envelope {}", envelope.id());
                return;
            }
            collect_recipients(&state, &envelope)
        };
        if recipients.is_empty() {
            log::trace!("envelope {} had no subscribers", envelope.id());
            return;
        }
        match self.inner.latency {
            None => deliver(&recipients, &envelope),
            Some(latency) => {
                let inner = Arc::downgrade(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    let Some(inner) = inner.upgrade() else { return };
                    if inner.state().destroyed {
                        return;
                    }
                    deliver(&recipients, &envelope);
                });
            }
        }
    }

    /// Permanently shut the bus down. Existing subscriptions are dropped and
    /// every later `publish` or `subscribe` becomes a no-op.
    pub fn destroy(&self) {
        let mut state = self.inner.state();
        state.destroyed = true;
        state.routes.clear();
        state.wildcard.clear();
        state.seen.clear();
        log::debug!("message bus destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state().destroyed
    }

    /// Number of handlers subscribed at `address`.
    pub fn subscriber_count(&self, address: &str) -> usize {
        self.inner
            .state()
            .routes
            .get(address)
            .map_or(0, |routes| routes.len())
    }

    /// Number of addresses with at least one subscriber.
    pub fn address_count(&self) -> usize {
        self.inner.state().routes.len()
    }

    pub fn wildcard_count(&self) -> usize {
        self.inner.state().wildcard.len()
    }
}

impl<T: Send + Sync + 'static> Default for MessageBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Record an envelope in the duplicate-tracking table. Returns false if this
/// exact instance was already published.
fn remember<T>(state: &mut BusState<T>, envelope: &Arc<Envelope<T>>) -> bool {
    let key = Arc::as_ptr(envelope) as usize;
    if let Some(seen) = state.seen.get(&key) {
        if seen.strong_count() > 0 {
            return false;
        }
    }
    if state.seen.len() >= SEEN_PRUNE_THRESHOLD {
        state.seen.retain(|_, weak| weak.strong_count() > 0);
    }
    state.seen.insert(key, Arc::downgrade(envelope));
    true
}

/// Snapshot the handlers an envelope should reach, deduplicated by handler
/// identity so a handler subscribed at several addresses runs once.
fn collect_recipients<T>(state: &BusState<T>, envelope: &Envelope<T>) -> Vec<Handler<T>> {
    let mut out = Vec::new();
    let mut picked: HashSet<usize> = HashSet::new();
    let mut push = |handler: &Handler<T>| {
        let key = Arc::as_ptr(handler).cast::<()>() as usize;
        if picked.insert(key) {
            out.push(Arc::clone(handler));
        }
    };
    match envelope.destination() {
        Some(address) => {
            if let Some(routes) = state.routes.get(address) {
                for route in routes {
                    push(&route.handler);
                }
            }
        }
        None => {
            for routes in state.routes.values() {
                for route in routes {
                    push(&route.handler);
                }
            }
        }
    }
    for route in &state.wildcard {
        push(&route.handler);
    }
    out
}

fn deliver<T>(recipients: &[Handler<T>], envelope: &Arc<Envelope<T>>) {
    for handler in recipients {
        handler(envelope);
    }
}

enum SubscriptionKey {
    At(Address, u64),
    Wildcard(u64),
}

/// Guard for an active subscription. Dropping it removes the handler; when
/// the last handler at an address goes, the address entry goes with it.
pub struct Subscription<T> {
    bus: Weak<BusInner<T>>,
    key: Option<SubscriptionKey>,
}

impl<T> Subscription<T> {
    fn inert() -> Self {
        Subscription {
            bus: Weak::new(),
            key: None,
        }
    }

    /// Explicitly end the subscription. Equivalent to dropping the guard.
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else { return };
        let Some(inner) = self.bus.upgrade() else { return };
        let mut state = inner.state();
        match key {
            SubscriptionKey::At(address, id) => {
                if let Some(routes) = state.routes.get_mut(&address) {
                    routes.retain(|route| route.id != id);
                    if routes.is_empty() {
                        state.routes.remove(&address);
                    }
                }
            }
            SubscriptionKey::Wildcard(id) => {
                state.wildcard.retain(|route| route.id != id);
            }
        }
    }
}
