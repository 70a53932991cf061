//! Gemini Balance — credential pool, health tracking and failover for a
//! rate-limited, key-authenticated generative AI API.
//!
//! The pieces, leaves first:
//! - [`store::CredentialStore`] owns every key and persists each change.
//! - [`health::HealthTracker`] turns attempt outcomes into key transitions.
//! - [`selection::SelectionStrategy`] picks a key from a pool snapshot.
//! - [`failover::FailoverCoordinator`] retries a request on other keys.
//! - [`gateway::Gateway`] is the entry point for requests and administration.

pub mod clock;
pub mod config;
pub mod error;
pub mod failover;
pub mod gateway;
pub mod health;
pub mod key;
pub mod outcome;
pub mod selection;
pub mod server;
pub mod store;
pub mod upstream;
pub mod vault;

pub use error::{GatewayError, PoolError};
pub use gateway::{Gateway, GatewayOptions};
