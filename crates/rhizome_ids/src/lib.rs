//! Identifier newtypes shared across the Rhizome crates.
//!
//! Each id wraps the canonical string form of a v4 UUID. Keeping the string
//! (rather than the parsed `Uuid`) makes database binds and serde
//! transparent without re-rendering on every use; `parse` still insists the
//! content is a real UUID.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A string that failed to parse as one of the id types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} {value:?} is not a valid UUID")]
pub struct IdParseError {
    kind: &'static str,
    value: String,
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wrap an existing identifier, rejecting anything that is not
            /// a UUID.
            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                match Uuid::try_parse(value) {
                    Ok(_) => Ok(Self(value.to_owned())),
                    Err(_) => Err(IdParseError {
                        kind: stringify!($name),
                        value: value.to_owned(),
                    }),
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
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id! {
    /// One ingestion (or restore) job in the store.
    JobId
}

uuid_id! {
    /// One evidence instance node in the graph.
    InstanceId
}

uuid_id! {
    /// One worker process, for leases and claim attribution.
    WorkerId
}
