//! Unique constraint enforcement.
//!
//! Each command may declare side-index entries. Within one push they are split
//! into deletes (`Remove`, `TenantRemove`) and inserts (`Add`); every delete runs
//! before any insert so that swapping a value between two commands of the same
//! batch cannot collide with itself.
//!
//! A batched insert reports a single violation for the whole statement. The
//! offending constraint is found by looking for its `(tenant, type, value)` key
//! in the store's violation detail.

use tracing::debug;

use eventvault_core::{Command, EventStoreError, TenantId, UniqueConstraint, UniqueConstraintAction};

use crate::store::{ConstraintDelete, ConstraintKey, StoreError, StoreTx};

/// Deletes and inserts derived from a batch of commands.
#[derive(Debug, Default)]
pub struct ConstraintPlan<'a> {
    deletes: Vec<ConstraintDelete>,
    adds: Vec<ConstraintKey>,
    declared: Vec<(ConstraintKey, &'a UniqueConstraint)>,
}

impl<'a> ConstraintPlan<'a> {
    pub fn from_commands(commands: &'a [Command]) -> Self {
        let mut plan = Self::default();

        for command in commands {
            for constraint in &command.unique_constraints {
                let tenant_id = if constraint.is_global {
                    TenantId::global()
                } else {
                    command.aggregate.tenant_id.clone()
                };
                let key = ConstraintKey {
                    tenant_id: tenant_id.clone(),
                    unique_type: constraint.unique_type.clone(),
                    unique_value: constraint.unique_value.clone(),
                };

                match constraint.action {
                    UniqueConstraintAction::Add => {
                        plan.adds.push(key.clone());
                        plan.declared.push((key, constraint));
                    }
                    UniqueConstraintAction::Remove => plan.deletes.push(ConstraintDelete::Key(key)),
                    UniqueConstraintAction::TenantRemove => {
                        plan.deletes.push(ConstraintDelete::Tenant(tenant_id))
                    }
                }
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.adds.is_empty()
    }

    pub fn deletes(&self) -> &[ConstraintDelete] {
        &self.deletes
    }

    pub fn adds(&self) -> &[ConstraintKey] {
        &self.adds
    }

    /// The declared `Add` constraint whose key appears in a violation detail.
    pub fn attribute(&self, detail: &str) -> Option<&'a UniqueConstraint> {
        self.declared
            .iter()
            .find(|(key, _)| detail.contains(&key.detail_fragment()))
            .map(|(_, constraint)| *constraint)
    }

    /// Apply the plan inside `tx`: deletes first, then inserts.
    pub async fn enforce<T>(&self, tx: &mut T) -> Result<(), EnforceError>
    where
        T: StoreTx + ?Sized,
    {
        if self.is_empty() {
            return Ok(());
        }

        tx.delete_unique_constraints(&self.deletes)
            .await
            .map_err(|e| self.classify(e, "failed to delete unique constraints"))?;
        tx.insert_unique_constraints(&self.adds)
            .await
            .map_err(|e| self.classify(e, "failed to add unique constraints"))?;

        debug!(
            deletes = self.deletes.len(),
            adds = self.adds.len(),
            "unique constraints enforced"
        );
        Ok(())
    }

    fn classify(&self, err: StoreError, context: &str) -> EnforceError {
        match err {
            StoreError::UniqueViolation { ref detail, .. } => match self.attribute(detail) {
                Some(constraint) => {
                    EnforceError::Rejected(EventStoreError::already_exists(&constraint.error_message))
                }
                None => EnforceError::Rejected(EventStoreError::internal_with(context, err)),
            },
            other if other.is_retryable() => EnforceError::Store(other),
            other => EnforceError::Rejected(EventStoreError::internal_with(context, other)),
        }
    }
}

/// Outcome of a failed enforcement.
#[derive(Debug)]
pub enum EnforceError {
    /// Terminal: surface to the caller as is.
    Rejected(EventStoreError),
    /// A retryable store failure; the push loop decides.
    Store(StoreError),
}
