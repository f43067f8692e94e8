//! # courier-store
//!
//! Storage seams of the delivery core and their backends.
//!
//! The dispatcher, the hub and the sync coordinator only ever talk to the
//! narrow async traits in [`traits`]: presence, offline backlog, message
//! persistence, conversation markers and group membership. Two backends
//! implement all of them:
//!
//! - [`SqliteStore`]: one SQLite file (WAL) that every process on a host can
//!   open; each logical update is a single statement or transaction.
//! - [`MemoryStore`]: process-local maps for tests and single-process runs.

pub mod conversations;
pub mod database;
pub mod groups;
pub mod kv;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod retry;
pub mod sqlite;
pub mod traits;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use retry::with_retries;
pub use sqlite::SqliteStore;
pub use traits::{
    ConversationStore, DrainedBacklog, GroupDirectory, MessageStore, OfflineStore,
    PresenceRegistry,
};
