//! Core types for the batchline event batch subscription pipeline.
//!
//! This crate provides the building blocks for consuming an append-only
//! event log in batches:
//!
//! - [`event`] - Stored events, positions, envelopes, and payload decoding
//! - [`consumer`] - Consumer policy (`EventConsumer`) and delivery sink
//!   (`EventSink`)
//! - [`source`] - Event source / subscription transport abstraction, sender
//!   identity, and a reference in-memory source
//! - [`subscriber`] - The decode → batch → dispatch pipeline and the
//!   `BatchSubscriber` front object
//!
//! Most users should depend on the `batchline` crate, which re-exports these
//! types with a cleaner API surface.

pub mod consumer;
pub mod event;
pub mod source;
pub mod subscriber;

// Test utilities module: public when feature enabled, internal for crate tests
#[cfg(feature = "test-util")]
pub mod test;

#[cfg(all(test, not(feature = "test-util")))]
pub(crate) mod test;
