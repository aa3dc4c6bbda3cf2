//! Strongly-typed identifiers.
//!
//! Row identifiers are UUID-backed newtypes; parsing a foreign string checks
//! the UUID shape at construction time so malformed ids cannot enter the
//! store. Author-facing story ids (node/choice/quest/event ids) stay plain
//! strings: they are authored text keyed into pack maps, not row identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Defines a UUID-backed row id newtype.
///
/// Generates `new()` (v4), `from_string()` with UUID-shape validation,
/// `as_str()`, Display, Default, Serialize and Deserialize.
macro_rules! define_row_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Parse a foreign id; anything that is not a UUID is rejected.
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                match uuid::Uuid::parse_str(s.trim()) {
                    Ok(parsed) => Ok(Self(parsed.to_string())),
                    Err(_) => Err(concat!(stringify!($name), " must be a UUID")),
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_row_id!(SessionId);
define_row_id!(SnapshotId);
define_row_id!(ActionLogId);
define_row_id!(ReportId);
