//! # courier-shared
//!
//! Types shared by every tier of the Courier delivery core: user and gateway
//! identities, the message [`Envelope`] and its wire codec, broker topic
//! naming, the reconnect sync request, and signed access tokens.

pub mod codec;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod sync;
pub mod token;
pub mod topics;
pub mod types;

pub use codec::WireFormat;
pub use envelope::{Attachment, Content, ContentType, Envelope, MessageType, TextBody};
pub use error::{CodecError, TokenError, ValidationError};
pub use sync::SyncRequest;
pub use token::AccessToken;
pub use topics::Topics;
pub use types::{ConversationId, GatewayId, GroupId, UserId};
