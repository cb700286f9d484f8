//! # arbit-core
//!
//! Core services for the arbit crowd-audit backend.
//!
//! This crate owns the request/response fan-in-fan-out plane and the
//! reliable event pipeline:
//!
//! - **Dispatcher**: bounded job queue + fixed worker pool brokering
//!   inference calls to providers, with backpressure and per-request
//!   cancellation
//! - **Outbox**: domain events written in the same transaction as the
//!   state change, drained by an at-least-once publisher
//! - **Voting**: pairwise vote recording with transactional event enqueue
//! - **Search**: the search-index client, query building and cursor codec
//! - **Community**: community conversation listing and feedback scores
//!
//! ## Crate Boundary
//!
//! `arbit-core` holds no HTTP routing. The API crate composes these
//! services; the indexer binary consumes the events they emit. External
//! collaborators (Postgres, Redis, Kafka, OpenSearch, providers) sit behind
//! small traits with in-memory implementations intended for tests and dev.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod community;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod observability;
pub mod outbox;
pub mod providers;
pub mod publisher;
pub mod search;
pub mod voting;

pub use error::{Error, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::dispatcher::{Dispatcher, InferenceJob, InferenceRequest, QueueStats};
    pub use crate::error::{Error, Result};
    pub use crate::outbox::{NewOutboxEvent, OutboxStore};
    pub use crate::publisher::{EventTransport, Publisher};
    pub use crate::voting::VotingService;
}
