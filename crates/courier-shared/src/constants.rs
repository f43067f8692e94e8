/// Application name
pub const APP_NAME: &str = "Courier";

/// First byte of every binary-encoded envelope.
///
/// A JSON document never starts with this byte, which lets the decoder pick
/// the binary path without guessing.
pub const BINARY_MAGIC: u8 = 0xC7;

/// Binary envelope schema version
pub const BINARY_VERSION: u8 = 1;

/// Maximum encoded envelope size in bytes (256 KiB)
pub const MAX_ENVELOPE_SIZE: u64 = 262_144;

/// Default outbound queue capacity per connection
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Default retention of an offline queue entry (7 days)
pub const DEFAULT_OFFLINE_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Action string carried by reconnect sync requests
pub const SYNC_ACTION: &str = "sync_offline";

/// Default broker topic names
pub const DEFAULT_INGEST_TOPIC: &str = "chat.ingest";
pub const DEFAULT_SYNC_TOPIC: &str = "chat.sync";
pub const DEFAULT_DELIVERY_PREFIX: &str = "chat.deliver.";

/// Default ports
pub const DEFAULT_BROKER_PORT: u16 = 7400;
pub const DEFAULT_GATEWAY_PORT: u16 = 8081;
pub const DEFAULT_LOGIC_PORT: u16 = 8080;
