//! In-memory event source implementation for testing.
//!
//! [`Source`] delivers published events to every active subscription through
//! a bounded per-subscription feed, one delivery task each. `publish` awaits
//! the feed sends, so a pipeline exercising backpressure stalls the
//! publisher exactly like a real event log subscription would stall its
//! upstream reads.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::mpsc;

use crate::{
    event::StoredEvent,
    source::{EventSource, EventSubscription, SenderId},
    subscriber::SubscriberHandle,
};

/// Capacity of each subscription's delivery feed.
const FEED_CAPACITY: usize = 16;

enum Feed {
    Event(StoredEvent),
    Error(Box<dyn std::error::Error + Send + Sync>),
}

struct Active {
    sender: SenderId,
    feed: mpsc::Sender<Feed>,
}

#[derive(Default)]
struct Inner {
    subscriptions: Vec<Active>,
    wake_ups: u64,
}

/// In-memory event source that fans published events out to its
/// subscriptions.
#[derive(Clone, Default)]
pub struct Source {
    inner: Arc<RwLock<Inner>>,
}

impl Source {
    /// Create a source with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one stored event to every active subscription, awaiting each
    /// feed's acceptance.
    pub async fn publish(&self, event: StoredEvent) {
        for (sender, feed) in self.feeds() {
            if feed.send(Feed::Event(event.clone())).await.is_err() {
                tracing::trace!(?sender, "delivery task gone, dropping event");
            }
        }
    }

    /// Report a source failure to every active subscription.
    pub async fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        for (sender, feed) in self.feeds() {
            if feed.send(Feed::Error(message.clone().into())).await.is_err() {
                tracing::trace!(?sender, "delivery task gone, dropping error");
            }
        }
    }

    fn feeds(&self) -> Vec<(SenderId, mpsc::Sender<Feed>)> {
        let inner = self.inner.read().expect("in-memory source lock poisoned");
        inner
            .subscriptions
            .iter()
            .map(|active| (active.sender, active.feed.clone()))
            .collect()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner
            .read()
            .expect("in-memory source lock poisoned")
            .subscriptions
            .len()
    }

    /// Number of wake-up nudges received across all subscriptions.
    #[must_use]
    pub fn wake_up_count(&self) -> u64 {
        self.inner
            .read()
            .expect("in-memory source lock poisoned")
            .wake_ups
    }
}

impl EventSource for Source {
    type Subscription = Subscription;

    fn subscribe<E: Send + 'static>(&self, subscriber: SubscriberHandle<E>) -> Subscription {
        let sender = SenderId::next();
        let (feed_tx, mut feed_rx) = mpsc::channel(FEED_CAPACITY);

        tokio::spawn(async move {
            while let Some(feed) = feed_rx.recv().await {
                let accepted = match feed {
                    Feed::Event(event) => subscriber.on_event(sender, event).await,
                    Feed::Error(error) => subscriber.on_error(sender, error).await,
                };
                if accepted.is_err() {
                    tracing::debug!(?sender, "subscriber completed, stopping delivery");
                    break;
                }
            }
        });

        let mut inner = self.inner.write().expect("in-memory source lock poisoned");
        inner.subscriptions.push(Active {
            sender,
            feed: feed_tx,
        });
        drop(inner);
        tracing::debug!(?sender, "subscription established");

        Subscription {
            sender,
            inner: Arc::clone(&self.inner),
            unsubscribed: AtomicBool::new(false),
        }
    }
}

/// Handle to one subscription on an in-memory [`Source`].
pub struct Subscription {
    sender: SenderId,
    inner: Arc<RwLock<Inner>>,
    unsubscribed: AtomicBool,
}

impl EventSubscription for Subscription {
    fn sender(&self) -> SenderId {
        self.sender
    }

    fn wake_up(&self) {
        // Nothing is buffered outside the feeds, so a nudge only needs to be
        // observable.
        let mut inner = self.inner.write().expect("in-memory source lock poisoned");
        inner.wake_ups += 1;
    }

    fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.write().expect("in-memory source lock poisoned");
        inner
            .subscriptions
            .retain(|active| active.sender != self.sender);
        drop(inner);
        tracing::debug!(sender = ?self.sender, "subscription released");
    }
}
