//! Event source and subscription transport abstraction.
//!
//! The pipeline consumes an append-only event log through these traits. A
//! source delivers raw stored events to a registered subscriber handle and
//! answers two control calls, [`wake_up`](EventSubscription::wake_up) and
//! [`unsubscribe`](EventSubscription::unsubscribe). Every subscription
//! attempt is issued a fresh [`SenderId`], which is what lets the dispatch
//! stage tell live jobs apart from those of a superseded subscription.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::subscriber::SubscriberHandle;

pub mod inmemory;

/// Opaque identity of one subscription instance.
///
/// Allocated from a process-wide generation counter; a resubscription yields
/// a new, distinct id. Identities are compared for equality only — they
/// carry no payload and no ordering semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SenderId(u64);

impl SenderId {
    /// Allocate the next identity.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared cell holding the sender a pipeline is currently bound to.
///
/// Written when a subscription is (re-)established, read by the dispatch
/// stage for the staleness check. Until a sender is bound, every job is
/// considered stale and discarded.
#[derive(Clone, Debug, Default)]
pub struct SenderBinding(Arc<AtomicU64>);

impl SenderBinding {
    /// Create an unbound binding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the current sender, superseding any previous one.
    pub fn bind(&self, sender: SenderId) {
        self.0.store(sender.0, Ordering::Release);
    }

    /// Whether `sender` matches the currently bound sender.
    #[must_use]
    pub fn is_current(&self, sender: SenderId) -> bool {
        self.0.load(Ordering::Acquire) == sender.0
    }

    /// The currently bound sender, if any.
    #[must_use]
    pub fn current(&self) -> Option<SenderId> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            id => Some(SenderId(id)),
        }
    }
}

/// One live subscription against an event source.
pub trait EventSubscription: Send + Sync + 'static {
    /// Identity of this subscription instance.
    fn sender(&self) -> SenderId;

    /// Nudge the source to re-check for new data.
    fn wake_up(&self);

    /// Release the subscription's resources.
    fn unsubscribe(&self);
}

/// A source of raw stored events.
///
/// Implementations deliver events by calling
/// [`SubscriberHandle::on_event`](crate::subscriber::SubscriberHandle::on_event)
/// (and errors via `on_error`), awaiting each call before the next: the call
/// resolves only once the pipeline has accepted the input, which is how
/// backpressure reaches the source's own upstream reads.
pub trait EventSource {
    /// The subscription handle type returned by [`subscribe`](Self::subscribe).
    type Subscription: EventSubscription;

    /// Register a subscriber and begin delivering events to it.
    fn subscribe<E: Send + 'static>(&self, subscriber: SubscriberHandle<E>) -> Self::Subscription;
}
