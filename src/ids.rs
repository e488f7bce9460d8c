//! Newtype identifiers shared across the engine.
//!
//! Every persisted entity is addressed by a UUID wrapped in its own type
//! so that a node id cannot be handed to a path lookup by accident.
//! Block ids are strings assigned by document generation and stay opaque.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from a string form; `None` when malformed.
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a user.
    UserId
);
uuid_id!(
    /// Unique identifier for an event in the append-only log.
    EventId
);
uuid_id!(
    /// Unique identifier for a study path.
    PathId
);
uuid_id!(
    /// Unique identifier for a path node.
    NodeId
);
uuid_id!(
    /// Unique identifier for a node activity.
    ActivityId
);
uuid_id!(
    /// Unique identifier for a concept.
    ConceptId
);
uuid_id!(
    /// Unique identifier for a decision trace.
    TraceId
);
uuid_id!(
    /// Unique identifier for a runtime prompt.
    PromptId
);

/// Identifier of a content block inside a node document.
///
/// Assigned by document generation; opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub String);

impl BlockId {
    /// Wrap a raw block id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlockId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BlockId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
