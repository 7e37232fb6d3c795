//! Hierarchical diagnostics pub/sub.
//!
//! Every component in this stack publishes advisory text messages through a
//! [`DiagnosticsBus`]. Subscribers register a delegate with a minimum
//! severity; buses can be chained so a child component's messages surface
//! through its parent with the child's name prefixed. Diagnostics are
//! observability only: a bus with no subscribers costs one atomic load per
//! publish and changes no behavior.

use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Informal severity levels.
///
/// Levels are open-ended `usize` values; higher is more important. These
/// two thresholds are the ones the stream reporter and the stack's own
/// publishers agree on.
pub mod levels {
    /// Something is off but the component keeps working.
    pub const WARNING: usize = 5;
    /// The component failed at what it was asked to do.
    pub const ERROR: usize = 10;
}

/// Sentinel meaning "no subscriber wants anything".
const NO_INTEREST: usize = usize::MAX;

/// A subscriber callback: `(sender_name, level, message)`.
///
/// The message arrives already decorated with the sender's context stack.
pub type DiagnosticsDelegate = Arc<dyn Fn(&str, usize, &str) + Send + Sync>;

struct Subscription {
    delegate: DiagnosticsDelegate,
    min_level: usize,
}

struct BusState {
    subscribers: HashMap<u64, Subscription>,
    next_token: u64,
    context: SmallVec<[String; 4]>,
}

struct Inner {
    name: Arc<str>,
    /// Minimum over all subscribers' thresholds, `NO_INTEREST` when there
    /// are none. Read without the lock on the publish fast path; written
    /// only under the lock.
    min_level: AtomicUsize,
    state: Mutex<BusState>,
}

impl Inner {
    fn publish(&self, level: usize, message: &str) {
        if level < self.min_level.load(Ordering::Acquire) {
            return;
        }
        let state = self.state.lock();
        let decorated;
        let message = if state.context.is_empty() {
            message
        } else {
            let mut chain = String::new();
            for context in &state.context {
                chain.push_str(context);
                chain.push_str(": ");
            }
            chain.push_str(message);
            decorated = chain;
            &decorated
        };
        // Delegates run under the bus lock; see the re-entrancy note on
        // DiagnosticsBus.
        for subscription in state.subscribers.values() {
            if level >= subscription.min_level {
                (subscription.delegate)(&self.name, level, message);
            }
        }
    }
}

/// A named diagnostics publisher with severity-filtered fan-out.
///
/// Cloning is cheap and yields another handle onto the same bus: clones
/// share subscribers, context stack, and name. The bus dies when the last
/// handle (including any embedded in a connection or endpoint) drops;
/// outstanding [`Unsubscriber`]s and chained delegates become no-ops.
///
/// # Re-entrancy
///
/// Subscriber delegates are invoked while the bus's internal lock is held.
/// A delegate must not synchronously publish to, subscribe to, or
/// unsubscribe from the *same* bus — doing so deadlocks. Publishing into a
/// *different* bus (the normal chaining arrangement) is fine as long as
/// the chain is acyclic.
#[derive(Clone)]
pub struct DiagnosticsBus {
    inner: Arc<Inner>,
}

impl DiagnosticsBus {
    /// Create a bus publishing under the given sender name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: Arc::from(name.into()),
                min_level: AtomicUsize::new(NO_INTEREST),
                state: Mutex::new(BusState {
                    subscribers: HashMap::new(),
                    next_token: 1,
                    context: SmallVec::new(),
                }),
            }),
        }
    }

    /// The sender name delivered with every message.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The lowest level any current subscriber wants, or `usize::MAX` when
    /// there are no subscribers. Publishes below this are free.
    #[must_use]
    pub fn min_level(&self) -> usize {
        self.inner.min_level.load(Ordering::Acquire)
    }

    /// Register a delegate for every message at `min_level` or above.
    ///
    /// The returned [`Unsubscriber`] removes the registration; it holds
    /// only a weak reference, so calling it after the bus is gone is a
    /// safe no-op.
    pub fn subscribe(&self, delegate: DiagnosticsDelegate, min_level: usize) -> Unsubscriber {
        let mut state = self.inner.state.lock();
        let token = state.next_token;
        state.next_token += 1;
        state.subscribers.insert(
            token,
            Subscription {
                delegate,
                min_level,
            },
        );
        self.inner
            .min_level
            .fetch_min(min_level, Ordering::AcqRel);
        Unsubscriber {
            inner: Arc::downgrade(&self.inner),
            token,
        }
    }

    /// Publish a message at the given level.
    ///
    /// If `level` is below every subscriber's threshold this returns
    /// without taking the lock. Otherwise the message is prefixed with the
    /// current context stack (outer to inner, each followed by `": "`) and
    /// delivered to each subscriber whose threshold admits it.
    pub fn publish(&self, level: usize, message: impl AsRef<str>) {
        self.inner.publish(level, message.as_ref());
    }

    /// Publish a lazily-formatted message.
    ///
    /// The closure runs only if some subscriber can hear `level`, so
    /// callers may format freely on hot paths:
    ///
    /// ```
    /// # use gangway_core::diagnostics::DiagnosticsBus;
    /// # let bus = DiagnosticsBus::new("demo");
    /// # let bytes_len = 42;
    /// bus.publish_with(0, || format!("sent {bytes_len} bytes"));
    /// ```
    pub fn publish_with(&self, level: usize, message: impl FnOnce() -> String) {
        if level < self.inner.min_level.load(Ordering::Acquire) {
            return;
        }
        self.inner.publish(level, &message());
    }

    /// Push a context string; subsequent messages are prefixed with it.
    ///
    /// Must be paired with [`pop_context`](Self::pop_context); prefer the
    /// scoped [`context`](Self::context) guard.
    pub fn push_context(&self, context: impl Into<String>) {
        self.inner.state.lock().context.push(context.into());
    }

    /// Pop the innermost context string.
    pub fn pop_context(&self) {
        self.inner.state.lock().context.pop();
    }

    /// Push a context string for the lifetime of the returned guard.
    pub fn context(&self, context: impl Into<String>) -> ContextGuard<'_> {
        self.push_context(context);
        ContextGuard { bus: self }
    }

    /// A delegate that republishes into this bus, suitable for subscribing
    /// this bus to another bus's messages.
    ///
    /// Forwarded messages get `"<remote sender name>: "` prefixed. If this
    /// bus has been dropped by the time a message arrives, the message is
    /// silently discarded.
    #[must_use]
    pub fn chain(&self) -> DiagnosticsDelegate {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |sender_name: &str, level: usize, message: &str| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.publish(level, &format!("{sender_name}: {message}"));
        })
    }
}

impl std::fmt::Debug for DiagnosticsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsBus")
            .field("name", &self.inner.name)
            .field("min_level", &self.min_level())
            .finish_non_exhaustive()
    }
}

/// Capability to remove one subscription from a [`DiagnosticsBus`].
#[derive(Clone)]
pub struct Unsubscriber {
    inner: Weak<Inner>,
    token: u64,
}

impl Unsubscriber {
    /// Remove the subscription. No-op if the bus is gone or the
    /// subscription was already removed.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock();
        let Some(removed) = state.subscribers.remove(&self.token) else {
            return;
        };
        // Only rescan when the departing subscriber may have been the one
        // holding the cached minimum down.
        if removed.min_level == inner.min_level.load(Ordering::Acquire) {
            let new_min = state
                .subscribers
                .values()
                .map(|s| s.min_level)
                .min()
                .unwrap_or(NO_INTEREST);
            inner.min_level.store(new_min, Ordering::Release);
        }
    }
}

/// Scope guard pairing a context push with its pop on every exit path.
pub struct ContextGuard<'a> {
    bus: &'a DiagnosticsBus,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.bus.pop_context();
    }
}
