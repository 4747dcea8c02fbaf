//! String identifiers used across the event log.
//!
//! Equality is exact, case-sensitive string comparison.

use serde::{Deserialize, Serialize};

/// Identifier of a tenant (multi-tenant boundary).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

/// Kind of aggregate a stream belongs to (e.g. `"user"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateType(String);

/// Identifier of an aggregate instance within its type and tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

/// Stable event name (e.g. `"user.created"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

/// Namespace of a unique constraint (e.g. `"user.email"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueType(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(TenantId);
impl_string_newtype!(AggregateType);
impl_string_newtype!(AggregateId);
impl_string_newtype!(EventType);
impl_string_newtype!(UniqueType);

/// Tenant used as the scope of global unique constraints.
pub const GLOBAL_TENANT: &str = "default";

impl TenantId {
    /// The reserved cross-tenant scope.
    pub fn global() -> Self {
        Self(GLOBAL_TENANT.to_string())
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_TENANT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_is_case_sensitive() {
        assert_ne!(AggregateType::from("User"), AggregateType::from("user"));
        assert_eq!(EventType::from("user.created"), EventType::new("user.created"));
    }

    #[test]
    fn global_tenant_is_reserved_default() {
        assert_eq!(TenantId::global().as_str(), "default");
        assert!(TenantId::global().is_global());
        assert!(!TenantId::from("t1").is_global());
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&AggregateId::from("u1")).unwrap();
        assert_eq!(json, "\"u1\"");
    }
}
