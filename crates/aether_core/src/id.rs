//! Identifier newtypes for participants and rooms.
//!
//! Both are opaque strings assigned by the transport (connection ids) or by
//! whoever shares a room link, so no format is enforced beyond non-emptiness.

use std::fmt;

/// Macro to define string-backed ID types with minimal boilerplate
macro_rules! define_id_type {
    ($(#[$meta:meta])* $type_name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Clone,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(pub String);

        impl $type_name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $type_name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $type_name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $type_name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $type_name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id_type!(
    /// A connected participant, keyed by its channel connection id.
    AgentId
);

define_id_type!(
    /// A room namespace shared by participants.
    RoomId
);

impl RoomId {
    /// Rooms created by a host are named after the host's connection.
    pub fn from_connection(agent: &AgentId) -> Self {
        Self(agent.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_transparently() {
        let id = AgentId::new("sock-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sock-42\"");
        let room: RoomId = serde_json::from_str("\"lobby\"").unwrap();
        assert_eq!(room.as_str(), "lobby");
    }

    #[test]
    fn test_room_from_connection() {
        let host = AgentId::new("abc");
        assert_eq!(RoomId::from_connection(&host), RoomId::new("abc"));
    }
}
