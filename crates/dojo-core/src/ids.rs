//! Branded ID newtypes.
//!
//! Each identifier is a newtype around `String`. Engine-minted ids
//! ([`SessionId`], [`EnvironmentId`]) are UUID v7 so they sort by creation
//! time; ids that come from outside the engine (workshops, users, steps) are
//! taken verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
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
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

macro_rules! minted_id {
    ($name:ident) => {
        impl $name {
            /// Mint a new opaque ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

branded_id! {
    /// Opaque token identifying one live workshop attempt.
    SessionId
}
minted_id!(SessionId);

branded_id! {
    /// Identifier of a sandbox environment, assigned by the provisioner.
    EnvironmentId
}
minted_id!(EnvironmentId);

branded_id! {
    /// Identifier of a workshop in the content catalog.
    WorkshopId
}

branded_id! {
    /// Identifier of the user attempting a workshop.
    UserId
}

branded_id! {
    /// Identifier of one step within a workshop.
    StepId
}
