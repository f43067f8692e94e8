//! # courier-gateway
//!
//! The client-facing edge of the delivery core. One gateway process:
//!
//! - accepts authenticated websocket connections and keeps them in its
//!   [`hub::Hub`] (at most one per identity),
//! - stamps and publishes every inbound envelope to the shared ingest topic,
//! - consumes its own delivery topic and pushes each record to the matching
//!   local connection, falling back to the offline store,
//! - records presence for its users and asks the logic tier for an offline
//!   backlog drain whenever a user connects.

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod rate_limit;

pub use config::GatewayConfig;
pub use delivery::{DeliveryConsumer, DeliveryOutcome};
pub use error::GatewayError;
pub use hub::{Connection, Hub};
pub use ingest::IngestPublisher;
