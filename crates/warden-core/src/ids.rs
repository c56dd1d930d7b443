//! Identifier newtypes
//!
//! Run, agent and operation ids come from the host and are opaque strings.
//! Snapshot and DLQ item ids are generated here as ULIDs so they sort by
//! creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier
            #[inline]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow as str
            #[inline]
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

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

macro_rules! generated_id {
    ($(#[$meta:meta])* $name:ident) => {
        string_id!($(#[$meta])* $name);

        impl $name {
            /// Generate a fresh, time-ordered id
            #[inline]
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new().to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a governed batch run
    RunId
);

string_id!(
    /// Identifier of a sub-agent charged against a run budget
    AgentId
);

generated_id!(
    /// Identifier of a governed operation (begin/commit/abort) or loop scope
    OperationId
);

generated_id!(
    /// Identifier of an immutable snapshot
    SnapshotId
);

generated_id!(
    /// Identifier of a dead-letter queue entry
    DlqItemId
);
