//! Consumer policy and delivery sink.
//!
//! A consumer contributes two things to a subscription: a *policy*
//! ([`EventConsumer`]) describing which raw events it wants and how they
//! should be batched, and a *sink* ([`EventSink`]) receiving the decoded
//! batches. The split keeps the cheap pre-decode filter on the raw side of
//! the pipeline while delivery stays typed.

use std::{future::Future, time::Duration};

use thiserror::Error;

use crate::event::{DecodeError, Envelope, Position, StoredEvent};

/// Fault delivered to a consumer sink via [`EventSink::on_error`].
///
/// After receiving one of these the consumer is expected to resynchronize,
/// typically by requesting replay from its last known-good position; the
/// pipeline itself never retries.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// An event payload could not be decoded.
    #[error("failed to decode event: {0}")]
    Decode(#[source] DecodeError),
    /// The event source reported an error.
    #[error("event source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Consumer-supplied subscription policy.
///
/// The defaults mirror an unconfigured consumer: every event is relevant and
/// batching is effectively disabled (batches of one). The pipeline clamps
/// whatever the policy returns to a batch size of at least 1 and a delay of
/// at least 100 ms.
pub trait EventConsumer: Send + Sync + 'static {
    /// Cheap pre-decode filter over raw event metadata.
    ///
    /// Events rejected here are never decoded, but still flow through the
    /// pipeline so their positions advance the consumer's checkpoint.
    fn handles(&self, stored: &StoredEvent) -> bool {
        let _ = stored;
        true
    }

    /// Maximum number of events collected into one batch.
    fn batch_size(&self) -> usize {
        1
    }

    /// Maximum time a batch may wait for further events after its first one.
    fn batch_delay(&self) -> Duration {
        Duration::from_millis(500)
    }
}

/// Delivery target for decoded event batches.
///
/// The dispatch stage serializes calls strictly: the next delivery starts
/// only after the previous one's future has resolved, so implementations can
/// assume single-threaded access. Slow sinks backpressure the whole pipeline
/// up to the event source.
pub trait EventSink: Send + Sync + 'static {
    /// The decoded domain event type.
    type Event: Send + 'static;

    /// Deliver one ordered group of decoded events.
    ///
    /// `position` is the checkpoint after the last raw event examined for
    /// this group — it can lie past the last entry of `events` when trailing
    /// events were filtered or had no known mapping, and `events` may be
    /// empty for the same reason.
    fn on_events(
        &self,
        events: Vec<Envelope<Self::Event>>,
        position: Position,
    ) -> impl Future<Output = ()> + Send;

    /// Deliver a fault for the current group.
    fn on_error(&self, error: SubscriberError) -> impl Future<Output = ()> + Send;
}
