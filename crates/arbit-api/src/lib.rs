//! # arbit-api
//!
//! HTTP composition layer for the arbit crowd-audit backend.
//!
//! This crate is a thin adapter with no domain policy of its own: it parses
//! requests, applies the rate limiter, invokes the dispatcher and the
//! voting/search/community services from `arbit-core`, and encodes the
//! responses.
//!
//! ## Endpoints
//!
//! ```text
//! GET  /healthz                              - liveness
//! GET  /metrics                              - Prometheus text exposition
//! POST /api/infer                            - brokered inference
//! GET  /api/pairs/random                     - random pair for evaluation
//! POST /api/votes                            - record a pairwise vote
//! GET  /api/search/pairs                     - search the derived index
//! GET  /api/community/conversations          - community feed
//! POST /api/community/conversations/vote     - community feedback score
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod routes;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{AppState, Server};
