//! Newtype identifiers used across the gateway.
//!
//! Grounded on the teacher's `FileId`/`BatchId`/`TemplateId` pattern: a thin wrapper
//! over a UUID with a truncated `Display` for logs. `RequestId` specifically wraps a
//! UUIDv7 so that request ids are lexicographically time-ordered, as required by
//! the request data model ("opaque id (time-ordered unique string)").

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                $name(uuid)
            }
        }

        impl Deref for $name {
            type Target = Uuid;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(RequestId);
uuid_id!(ApiKeyId);

/// A provider's configured name. Newtype'd so call sites can't accidentally compare
/// a provider name against a model name or an arbitrary string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderName(pub String);

impl ProviderName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderName {
    fn from(s: &str) -> Self {
        ProviderName(s.to_string())
    }
}

impl From<String> for ProviderName {
    fn from(s: String) -> Self {
        ProviderName(s)
    }
}

impl Deref for ProviderName {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_time_ordered() {
        let a = RequestId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = RequestId::new();
        assert!(a.0.to_string() < b.0.to_string());
    }

    #[test]
    fn provider_name_displays_bare() {
        let p = ProviderName::from("anthropic-main");
        assert_eq!(p.to_string(), "anthropic-main");
    }
}
