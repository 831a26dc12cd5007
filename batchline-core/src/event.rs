//! Stored events, positions, envelopes, and payload decoding.
//!
//! The pipeline consumes [`StoredEvent`]s — raw persisted records emitted by
//! an event log subscription — and turns the relevant ones into typed
//! [`Envelope`]s via an [`EventDecoder`]. Decoding distinguishes two failure
//! classes: an *unknown kind* ([`DecodeError::UnknownKind`]) is an expected,
//! non-fatal condition (a forward-incompatible event written by a newer
//! deployment, say) and the event is silently skipped; any other failure is a
//! fault surfaced to the consumer.

use std::{fmt, marker::PhantomData};

use thiserror::Error;

/// Opaque checkpoint token identifying a point in an event stream.
///
/// Positions are produced by the event source, carried through the pipeline
/// unchanged, and handed to the consumer as "position after the last event in
/// this delivered group". The source defines their total order; the pipeline
/// never compares two positions beyond equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Position(String);

impl Position {
    /// Wrap a source-issued checkpoint token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, as issued by the source.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Position {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for Position {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// A raw, persisted event record as read from the event log.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    /// Name of the stream this event was appended to.
    pub stream: String,
    /// Checkpoint token for this event.
    pub position: Position,
    /// Monotonically increasing sequence number within the stream.
    pub stream_number: u64,
    /// Event type tag used to resolve a payload mapping.
    pub kind: String,
    /// Serialized payload.
    pub data: serde_json::Value,
}

/// A decoded event plus its stream metadata.
///
/// Written exactly once, by the decode stage, and immutable afterwards.
#[derive(Clone, Debug)]
pub struct Envelope<E> {
    /// The decoded domain event.
    pub event: E,
    /// Position of the originating stored event.
    pub position: Position,
    /// Sequence number of the originating stored event within its stream.
    pub stream_number: u64,
}

/// Error returned when decoding a stored event's payload fails.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The event kind has no known mapping.
    ///
    /// This is the expected, recoverable case: the event is dropped without
    /// an error, but its position still advances the consumer's checkpoint.
    #[error("unknown event kind `{kind}`, expected one of {expected:?}")]
    UnknownKind {
        /// The unrecognized event kind string.
        kind: String,
        /// The event kinds the decoder can handle.
        expected: &'static [&'static str],
    },
    /// The payload could not be deserialized.
    #[error("failed to decode event payload: {0}")]
    Payload(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DecodeError {
    /// Create a payload error variant.
    pub fn payload(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Payload(source.into())
    }
}

/// Maps raw stored events to typed domain events.
///
/// Decoding is assumed non-trivially expensive; the pipeline only invokes the
/// decoder for events the consumer's predicate accepted. Implementations must
/// report unrecognized kinds via [`DecodeError::UnknownKind`] so the pipeline
/// can skip them without faulting the stream.
pub trait EventDecoder: Send + Sync + 'static {
    /// The decoded domain event type.
    type Event: Send + 'static;

    /// Decode one stored event's payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownKind`] if the event kind is not
    /// recognized, or [`DecodeError::Payload`] if deserialization fails.
    fn decode(&self, stored: &StoredEvent) -> Result<Self::Event, DecodeError>;
}

/// Marker trait for events that can be read back from the event log.
///
/// Each event carries a unique [`Self::KIND`] identifier so a decoder can
/// route stored payloads back to the correct type.
pub trait DomainEvent {
    /// Stable event type tag, matched against [`StoredEvent::kind`].
    const KIND: &'static str;
}

/// Trait for event sum types that can deserialize themselves from stored
/// events.
///
/// Implemented by hand on the consumer's event enum:
///
/// ```ignore
/// enum ShopEvent {
///     Ordered(OrderPlaced),
///     Shipped(OrderShipped),
/// }
///
/// impl DecodableEvent for ShopEvent {
///     const EVENT_KINDS: &'static [&'static str] =
///         &[OrderPlaced::KIND, OrderShipped::KIND];
///
///     fn from_stored(stored: &StoredEvent) -> Result<Self, DecodeError> {
///         match stored.kind.as_str() {
///             OrderPlaced::KIND => serde_json::from_value(stored.data.clone())
///                 .map(Self::Ordered)
///                 .map_err(DecodeError::payload),
///             OrderShipped::KIND => serde_json::from_value(stored.data.clone())
///                 .map(Self::Shipped)
///                 .map_err(DecodeError::payload),
///             other => Err(DecodeError::UnknownKind {
///                 kind: other.to_string(),
///                 expected: Self::EVENT_KINDS,
///             }),
///         }
///     }
/// }
/// ```
pub trait DecodableEvent: Sized {
    /// The list of event kinds this sum type can deserialize.
    const EVENT_KINDS: &'static [&'static str];

    /// Deserialize an event from its stored representation.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownKind`] if the event kind is not
    /// recognized, or [`DecodeError::Payload`] if deserialization fails.
    fn from_stored(stored: &StoredEvent) -> Result<Self, DecodeError>;
}

/// JSON decoder for hand-written [`DecodableEvent`] sum types.
pub struct JsonDecoder<E>(PhantomData<fn() -> E>);

impl<E> JsonDecoder<E> {
    /// Create a decoder for the event sum type `E`.
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for JsonDecoder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for JsonDecoder<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for JsonDecoder<E> {}

impl<E> fmt::Debug for JsonDecoder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonDecoder")
    }
}

impl<E> EventDecoder for JsonDecoder<E>
where
    E: DecodableEvent + Send + 'static,
{
    type Event = E;

    fn decode(&self, stored: &StoredEvent) -> Result<E, DecodeError> {
        E::from_stored(stored)
    }
}
