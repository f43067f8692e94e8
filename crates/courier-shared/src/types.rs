use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Authenticated user identity (the `sub` of an access token).
    UserId
);

string_id!(
    /// Stable identifier of one gateway process, known at startup.
    /// Names the gateway's private delivery topic.
    GatewayId
);

string_id!(
    /// Group identifier, resolved to a member list at fan-out time.
    GroupId
);

string_id!(
    /// Conversation (private pair or group) identifier.
    ConversationId
);

impl ConversationId {
    /// Deterministic id for the private conversation between two users.
    ///
    /// Participants are sorted so both sides derive the same id.
    pub fn private_pair(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("p:{lo}:{hi}"))
    }

    pub fn group(group: &GroupId) -> Self {
        Self(format!("g:{group}"))
    }
}
