//! Chronicle Core: an append-only event store for development-workflow
//! automation.
//!
//! One chronological stream of immutable, schema-validated events carries
//! everything the system does. Consistency boundaries are dynamic: events
//! carry an open tag map and queries select by tags instead of reading
//! per-entity streams. Large artifacts live in a content-addressed blob
//! store, secrets are masked before anything is persisted, materialized
//! projections serve current state, and the replay engine reconstructs
//! any past state deterministically from the same fold functions.

pub mod api;
pub mod blobs;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod masking;
pub mod observability;
pub mod pagination;
pub mod projections;
pub mod query;
pub mod replay;
pub mod retention;
pub mod storage;

pub use config::Config;
pub use correlation::CorrelationId;
pub use error::{ChronicleError, ErrorCode, Result};
pub use events::{DomainEvent, EventId, EventStore, NewEvent};
