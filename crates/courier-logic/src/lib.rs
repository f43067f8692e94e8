//! # courier-logic
//!
//! The routing tier of the delivery core.
//!
//! - [`Dispatcher`] consumes the shared ingest topic, persists each envelope
//!   and fans it out to the recipients' gateways or offline queues.
//! - [`SyncCoordinator`] consumes reconnect sync requests and replays a
//!   user's offline backlog to the gateway now holding the connection.
//! - [`api`] serves conversation history and group membership over HTTP.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod sync;

pub use config::LogicConfig;
pub use dispatcher::{DispatchReport, Dispatcher, Stores};
pub use error::{DispatchError, LogicError, SyncError};
pub use sync::{SyncCoordinator, SyncReport};
