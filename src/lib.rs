#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use batchline_core::test;
pub use batchline_core::{
    consumer,
    consumer::{EventConsumer, EventSink, SubscriberError},
    event,
    event::{
        DecodableEvent, DecodeError, DomainEvent, Envelope, EventDecoder, JsonDecoder, Position,
        StoredEvent,
    },
    subscriber,
    subscriber::{BatchSubscriber, Closed, Pipeline, SubscriberHandle},
};

pub mod source {
    //! Event source abstraction and the reference in-memory source.

    pub use batchline_core::source::{
        EventSource, EventSubscription, SenderBinding, SenderId, inmemory,
    };
}
