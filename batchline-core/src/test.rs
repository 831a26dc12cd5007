//! Shared test utilities for exercising subscription pipelines.
//!
//! Enabled for downstream crates via the `test-util` feature; the crate's own
//! tests use it unconditionally. Provides a small event domain, a sink that
//! records deliveries on a channel, a decoder wrapper that counts
//! invocations, and a consumer policy with scriptable predicate and batch
//! bounds.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    consumer::{EventConsumer, EventSink, SubscriberError},
    event::{
        DecodableEvent, DecodeError, DomainEvent, Envelope, EventDecoder, Position, StoredEvent,
    },
};

/// Test event: a value was added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueAdded {
    /// Amount added.
    pub amount: i64,
}

impl DomainEvent for ValueAdded {
    const KIND: &'static str = "value-added";
}

/// Test event: a value was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRemoved {
    /// Amount removed.
    pub amount: i64,
}

impl DomainEvent for ValueRemoved {
    const KIND: &'static str = "value-removed";
}

/// Sum type over the test events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestEvent {
    /// A [`ValueAdded`] event.
    Added(ValueAdded),
    /// A [`ValueRemoved`] event.
    Removed(ValueRemoved),
}

impl DecodableEvent for TestEvent {
    const EVENT_KINDS: &'static [&'static str] = &[ValueAdded::KIND, ValueRemoved::KIND];

    fn from_stored(stored: &StoredEvent) -> Result<Self, DecodeError> {
        match stored.kind.as_str() {
            ValueAdded::KIND => serde_json::from_value(stored.data.clone())
                .map(Self::Added)
                .map_err(DecodeError::payload),
            ValueRemoved::KIND => serde_json::from_value(stored.data.clone())
                .map(Self::Removed)
                .map_err(DecodeError::payload),
            other => Err(DecodeError::UnknownKind {
                kind: other.to_string(),
                expected: Self::EVENT_KINDS,
            }),
        }
    }
}

/// Build a stored event on stream `stream-a` whose position token and stream
/// number both derive from `number`.
#[must_use]
pub fn stored_event(number: u64, kind: &str, data: serde_json::Value) -> StoredEvent {
    StoredEvent {
        stream: "stream-a".to_string(),
        position: Position::new(number.to_string()),
        stream_number: number,
        kind: kind.to_string(),
        data,
    }
}

/// One delivery observed by a [`RecordingSink`].
#[derive(Debug)]
pub enum Delivery<E> {
    /// An `on_events` call.
    Events {
        /// Decoded envelopes, in delivery order.
        events: Vec<Envelope<E>>,
        /// Checkpoint after the delivered group.
        position: Position,
    },
    /// An `on_error` call.
    Error(SubscriberError),
}

/// Sink forwarding every delivery to an unbounded channel, so tests can
/// await and inspect them with `tokio::time::timeout`.
pub struct RecordingSink<E> {
    deliveries: mpsc::UnboundedSender<Delivery<E>>,
}

impl<E: Send + 'static> RecordingSink<E> {
    /// Create a sink and the receiver observing its deliveries.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery<E>>) {
        let (deliveries, rx) = mpsc::unbounded_channel();
        (Self { deliveries }, rx)
    }
}

impl<E: Send + 'static> EventSink for RecordingSink<E> {
    type Event = E;

    async fn on_events(&self, events: Vec<Envelope<E>>, position: Position) {
        let _ = self.deliveries.send(Delivery::Events { events, position });
    }

    async fn on_error(&self, error: SubscriberError) {
        let _ = self.deliveries.send(Delivery::Error(error));
    }
}

/// Decoder wrapper counting how often the inner decoder is invoked.
///
/// Clone the counter out via [`counter`](Self::counter) before handing the
/// decoder to a pipeline.
pub struct CountingDecoder<D> {
    inner: D,
    calls: Arc<AtomicUsize>,
}

impl<D> CountingDecoder<D> {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared invocation counter.
    #[must_use]
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl<D: EventDecoder> EventDecoder for CountingDecoder<D> {
    type Event = D::Event;

    fn decode(&self, stored: &StoredEvent) -> Result<Self::Event, DecodeError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.decode(stored)
    }
}

/// Consumer policy with scriptable predicate and batch bounds.
pub struct ScriptedConsumer {
    batch_size: usize,
    batch_delay: Duration,
    predicate: Box<dyn Fn(&StoredEvent) -> bool + Send + Sync>,
}

impl ScriptedConsumer {
    /// Policy accepting every event with the given batch bounds.
    #[must_use]
    pub fn new(batch_size: usize, batch_delay: Duration) -> Self {
        Self {
            batch_size,
            batch_delay,
            predicate: Box::new(|_| true),
        }
    }

    /// Replace the interest predicate.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&StoredEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Box::new(predicate);
        self
    }
}

impl EventConsumer for ScriptedConsumer {
    fn handles(&self, stored: &StoredEvent) -> bool {
        (self.predicate)(stored)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn batch_delay(&self) -> Duration {
        self.batch_delay
    }
}
