//! Identifier types shared across the SFU

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a participant, unique within its room
    PeerId
);

string_id!(
    /// Identifier of a room
    RoomId
);

string_id!(
    /// Identifier of a published media track, unique per publisher
    TrackId
);

impl PeerId {
    /// Generate a fresh random peer id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }
}

/// Key of a relayed track on a subscriber's connection.
///
/// Publisher and track ids are kept as separate fields, so ids containing
/// any delimiter character can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderKey {
    pub publisher: PeerId,
    pub track: TrackId,
}

impl SenderKey {
    pub fn new(publisher: PeerId, track: TrackId) -> Self {
        Self { publisher, track }
    }
}

impl fmt::Display for SenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.publisher, self.track)
    }
}
