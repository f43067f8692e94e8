//! Topic broker used between the gateways and the logic tier.
//!
//! Producers publish `(topic, key, payload)`; consumers subscribe with a
//! consumer group, and every group receives each message exactly once on one
//! of its members. [`MemoryBroker`] holds the topic table; [`server::serve`]
//! exposes it over TCP and [`RemoteBroker`] talks to it from other processes.

pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod server;
pub mod wire;

pub use broker::{Broker, BrokerMessage, Subscription};
pub use client::RemoteBroker;
pub use config::BrokerConfig;
pub use consumer::{consume, run_consumer, MessageHandler};
pub use error::BrokerError;
pub use memory::MemoryBroker;
