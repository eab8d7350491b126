#![forbid(
    dead_code,
    invalid_value,
    overflowing_literals,
    unconditional_recursion,
    unreachable_pub,
    unused_allocation,
    unsafe_code
)]
#![deny(
    bad_style,
    clippy::allow_attributes,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    rust_2021_compatibility,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_assignments,
    unused_attributes,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_qualifications,
    unused_results,
    unused_variables
)]

//! Shared vocabulary types and traits for the eventlog event store.
//!
//! This crate provides the foundational types that are shared between the
//! `eventlog` protocol crate and the storage backends (`eventlog-postgres`,
//! `eventlog-memory`). Keeping them in a separate crate lets backends depend
//! on the vocabulary without depending on each other.
//!
//! # Overview
//!
//! This crate contains:
//! - Events: `Event`, `Events`, `EventEnvelope`, `EventId`, `EventType`, `EventData`,
//!   `EventMetadata`
//! - Stream selection: `StreamName`, `VirtualStreamName`, `StreamSelector`,
//!   `EventStreamFilter`, `LoadQuery`
//! - Ordering: `Version`, `MaybeVersion`, `ExpectedVersion`, `SequenceNumber`, `CommitResult`
//! - Traits: `EventStore`, `CheckpointStorage`, `Clock`
//! - Errors: `EventStoreError`, `ConcurrencyError`, `CheckpointError`, `Operation`

mod checkpoint;
mod clock;
mod event;
mod query;
mod setup;
mod store;
mod stream;
mod validation;
mod version;

pub use checkpoint::{
    CheckpointError, CheckpointStorage, ProtocolViolation, SubscriberId, SubscriberIdError,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use event::{
    CausationId, CausationIdError, CorrelationId, CorrelationIdError, Event, EventData,
    EventEnvelope, EventId, EventIdError, EventMetadata, EventType, EventTypeError, Events,
    EventsError,
};
pub use query::LoadQuery;
pub use setup::{SetupReport, StoreStatus};
pub use store::{ConcurrencyError, EventStore, EventStoreError, EventStream, Operation};
pub use stream::{
    EventStreamFilter, StreamCategory, StreamCategoryError, StreamName, StreamNameError,
    StreamSelector, VirtualStreamName,
};
pub use version::{CommitResult, ExpectedVersion, MaybeVersion, SequenceNumber, Version};
