//! Commands: unpersisted write intents consumed exactly once by a push.

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::aggregate::Aggregate;
use crate::error::EventStoreError;
use crate::id::EventType;
use crate::unique_constraint::UniqueConstraint;

/// A request to append one event to an aggregate stream.
///
/// The payload is kept as a structured JSON value and only serialized to bytes by
/// the write pipeline. A command without a payload produces an event without
/// payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub aggregate: Aggregate,
    pub event_type: EventType,
    pub payload: Option<JsonValue>,
    pub creator: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl Command {
    pub fn new(aggregate: Aggregate, event_type: impl Into<EventType>) -> Self {
        Self {
            aggregate,
            event_type: event_type.into(),
            payload: None,
            creator: None,
            correlation_id: None,
            causation_id: None,
            unique_constraints: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach any serializable payload.
    pub fn try_payload<T: Serialize + ?Sized>(self, payload: &T) -> Result<Self, EventStoreError> {
        let value = serde_json::to_value(payload).map_err(|e| {
            EventStoreError::validation(format!("payload of '{}' is not serializable: {e}", self.event_type))
        })?;
        Ok(self.payload(value))
    }

    pub fn creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn unique_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }

    /// Reject commands that cannot be written, before any store I/O.
    pub fn validate(&self) -> Result<(), EventStoreError> {
        self.aggregate.validate()?;
        if self.event_type.is_empty() {
            return Err(EventStoreError::validation(format!(
                "command for {} has an empty event type",
                self.aggregate.stream_key()
            )));
        }
        for constraint in &self.unique_constraints {
            constraint.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::aggregate::AggregateVersion;

    fn user() -> Aggregate {
        Aggregate::new("t1", "user", AggregateVersion::default(), "u1", "org1")
    }

    #[test]
    fn builder_sets_envelope_fields() {
        let cmd = Command::new(user(), "user.created")
            .payload(json!({"name": "a"}))
            .creator("admin")
            .correlation_id("corr")
            .causation_id("cause")
            .unique_constraint(UniqueConstraint::add("email", "a@x", "taken"));

        assert_eq!(cmd.payload, Some(json!({"name": "a"})));
        assert_eq!(cmd.creator.as_deref(), Some("admin"));
        assert_eq!(cmd.correlation_id.as_deref(), Some("corr"));
        assert_eq!(cmd.causation_id.as_deref(), Some("cause"));
        assert_eq!(cmd.unique_constraints.len(), 1);
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn try_payload_serializes_structs() {
        #[derive(Serialize)]
        struct Created {
            name: &'static str,
        }

        let cmd = Command::new(user(), "user.created").try_payload(&Created { name: "a" }).unwrap();
        assert_eq!(cmd.payload, Some(json!({"name": "a"})));
    }

    #[test]
    fn empty_event_type_is_rejected() {
        let err = Command::new(user(), "").validate().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn invalid_constraint_is_rejected() {
        let cmd = Command::new(user(), "user.created").unique_constraint(UniqueConstraint::add("email", "", "m"));
        assert!(cmd.validate().unwrap_err().is_validation());
    }
}
