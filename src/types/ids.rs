//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize, Deserialize.
/// Optionally generates `new()` (UUID v4) and `Default` if `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        define_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: impl Into<String>) -> Result<Self, &'static str> {
                let s = s.into();
                if s.trim().is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(PipelineId, uuid);
define_id!(PhaseJobId, uuid);
define_id!(ProjectId);
define_id!(UserId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_ids_are_unique() {
        assert_ne!(PipelineId::new(), PipelineId::new());
        assert_ne!(PhaseJobId::new(), PhaseJobId::new());
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert!(ProjectId::from_string("").is_err());
        assert!(UserId::from_string("   ").is_err());
        assert_eq!(ProjectId::from_string("proj-1").unwrap().as_str(), "proj-1");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = ProjectId::from_string("proj-9").unwrap();
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("proj-9"));
    }
}
