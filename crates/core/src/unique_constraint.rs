//! Application-level uniqueness declared alongside commands.

use serde::{Deserialize, Serialize};

use crate::error::EventStoreError;
use crate::id::UniqueType;

/// What a unique constraint entry does when its command is pushed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueConstraintAction {
    /// Claim `(scope, type, value)`; fails the whole push if already claimed.
    Add,
    /// Release `(scope, type, value)`.
    Remove,
    /// Release every constraint held in the scope.
    TenantRemove,
}

/// A side-index entry enforcing uniqueness independent of the event key.
///
/// The scope is the command's tenant, or the reserved global tenant when
/// `is_global` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub unique_type: UniqueType,
    pub unique_value: String,
    pub action: UniqueConstraintAction,
    /// Message surfaced in [`EventStoreError::AlreadyExists`] when an `Add` collides.
    pub error_message: String,
    pub is_global: bool,
}

impl UniqueConstraint {
    pub fn add(
        unique_type: impl Into<UniqueType>,
        unique_value: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_value: unique_value.into(),
            action: UniqueConstraintAction::Add,
            error_message: error_message.into(),
            is_global: false,
        }
    }

    pub fn remove(unique_type: impl Into<UniqueType>, unique_value: impl Into<String>) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_value: unique_value.into(),
            action: UniqueConstraintAction::Remove,
            error_message: String::new(),
            is_global: false,
        }
    }

    pub fn tenant_remove() -> Self {
        Self {
            unique_type: UniqueType::default(),
            unique_value: String::new(),
            action: UniqueConstraintAction::TenantRemove,
            error_message: String::new(),
            is_global: false,
        }
    }

    /// Scope the constraint to the global tenant instead of the command's tenant.
    pub fn global(mut self) -> Self {
        self.is_global = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), EventStoreError> {
        if self.action == UniqueConstraintAction::TenantRemove {
            return Ok(());
        }
        if self.unique_type.is_empty() {
            return Err(EventStoreError::validation("unique constraint type is empty"));
        }
        if self.unique_value.is_empty() {
            return Err(EventStoreError::validation(format!(
                "unique constraint '{}' has an empty value",
                self.unique_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_action() {
        assert_eq!(UniqueConstraint::add("email", "a@x", "taken").action, UniqueConstraintAction::Add);
        assert_eq!(UniqueConstraint::remove("email", "a@x").action, UniqueConstraintAction::Remove);
        assert_eq!(UniqueConstraint::tenant_remove().action, UniqueConstraintAction::TenantRemove);
        assert!(UniqueConstraint::add("email", "a@x", "taken").global().is_global);
    }

    #[test]
    fn add_and_remove_require_type_and_value() {
        assert!(UniqueConstraint::add("", "a@x", "m").validate().is_err());
        assert!(UniqueConstraint::remove("email", "").validate().is_err());
        assert!(UniqueConstraint::tenant_remove().validate().is_ok());
    }
}
