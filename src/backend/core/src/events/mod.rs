//! Event envelope, schema validation, and the append pipeline.

pub mod envelope;
pub mod schema;
pub mod store;

pub use envelope::{Actor, ActorKind, DomainEvent, EventId, EventIdGenerator, NewEvent, Tags};
pub use schema::{SchemaRegistry, ValidationReport};
pub use store::{EventStore, RetryPolicy};
