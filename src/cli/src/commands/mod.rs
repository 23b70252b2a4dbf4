//! CLI command implementations.

pub mod config;
pub mod events;
pub mod health;
pub mod replay;
