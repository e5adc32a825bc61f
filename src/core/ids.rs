//! Identifier types for the conversation sync engine.
//!
//! All identifiers are opaque strings chosen by either the client or the
//! backend. Wrapping them in newtypes keeps node ids, correlation tags and
//! conversation files from being mixed up at call sites.
//!
//! ## Node id lifetimes
//! - *ephemeral*: generated here for optimistic display (`tmp_` prefix).
//! - *durable*: assigned by the backend and used for every protocol call
//!   once known.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking client-generated node ids.
pub const EPHEMERAL_PREFIX: &str = "tmp_";

/// Generate a collision-resistant suffix.
///
/// With feature `uuid_v7` enabled, this uses `Uuid::now_v7()` so tags sort by
/// creation time in logs. Otherwise it falls back to `Uuid::new_v4()`.
#[inline]
#[must_use]
fn unique_suffix() -> String {
    #[cfg(feature = "uuid_v7")]
    {
        Uuid::now_v7().simple().to_string()
    }
    #[cfg(not(feature = "uuid_v7"))]
    {
        Uuid::new_v4().simple().to_string()
    }
}

/// Declare a string newtype with a consistent API.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Extract the raw identifier.
            #[inline]
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            #[inline]
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            #[inline]
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// Identifier of a message node, ephemeral or durable.
    NodeId
);

define_string_id!(
    /// Caller-chosen correlation token shared by a request and all of its result events.
    Tag
);

define_string_id!(
    /// Identifies which open conversation an event belongs to.
    ConversationFile
);

impl NodeId {
    /// Generate a timestamp-derived id for optimistic display.
    #[must_use]
    pub fn ephemeral() -> Self {
        let millis = Utc::now().timestamp_millis();
        let suffix = unique_suffix();
        Self(format!("{EPHEMERAL_PREFIX}{millis}_{}", &suffix[..8]))
    }

    /// Whether this id was generated on the client.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.0.starts_with(EPHEMERAL_PREFIX)
    }
}

impl Tag {
    /// Generate a fresh tag with a readable prefix (`send`, `retry_ass`, ...).
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}_{}", unique_suffix()))
    }
}
