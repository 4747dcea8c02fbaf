//! Aggregate references: the identity and head position of an event stream.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EventStoreError;
use crate::id::{AggregateId, AggregateType, TenantId};

/// Schema version tag of an aggregate, written `v<major>[.<minor>[.<patch>]]`.
///
/// Only the major component is persisted; versions read back from storage carry
/// the major alone.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AggregateVersion {
    major: u32,
    minor: Option<u32>,
    patch: Option<u32>,
}

impl AggregateVersion {
    pub fn from_major(major: u32) -> Self {
        Self {
            major,
            minor: None,
            patch: None,
        }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> Option<u32> {
        self.minor
    }

    pub fn patch(&self) -> Option<u32> {
        self.patch
    }
}

impl Default for AggregateVersion {
    fn default() -> Self {
        Self::from_major(1)
    }
}

impl FromStr for AggregateVersion {
    type Err = EventStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            EventStoreError::validation(format!(
                "aggregate version '{s}' must match v<major>[.<minor>[.<patch>]]"
            ))
        };

        let rest = s.strip_prefix('v').ok_or_else(invalid)?;
        let mut parts = rest.split('.');
        let mut component = |required: bool| -> Result<Option<u32>, EventStoreError> {
            match parts.next() {
                None if required => Err(invalid()),
                None => Ok(None),
                Some(p) if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) => Err(invalid()),
                Some(p) => p.parse::<u32>().map(Some).map_err(|_| invalid()),
            }
        };

        let major = component(true)?.ok_or_else(invalid)?;
        let minor = component(false)?;
        let patch = if minor.is_some() { component(false)? } else { None };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl core::fmt::Display for AggregateVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
            if let Some(patch) = self.patch {
                write!(f, ".{patch}")?;
            }
        }
        Ok(())
    }
}

impl Serialize for AggregateVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AggregateVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of a single event stream: `(tenant, aggregate type, aggregate id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub tenant_id: TenantId,
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
}

impl core::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}:{}", self.tenant_id, self.aggregate_type, self.aggregate_id)
    }
}

/// Reference to an aggregate stream.
///
/// `sequence` counts the events in the stream: 0 before the first event, then
/// incremented by exactly one per appended event. On commands it is ignored (the
/// write pipeline resolves the current head itself); on events it is the sequence
/// the event received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub tenant_id: TenantId,
    pub aggregate_type: AggregateType,
    pub version: AggregateVersion,
    pub id: AggregateId,
    pub resource_owner: String,
    pub sequence: u64,
}

impl Aggregate {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        aggregate_type: impl Into<AggregateType>,
        version: AggregateVersion,
        id: impl Into<AggregateId>,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            id: id.into(),
            resource_owner: resource_owner.into(),
            sequence: 0,
        }
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            tenant_id: self.tenant_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.id.clone(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), EventStoreError> {
        if self.tenant_id.is_empty() {
            return Err(EventStoreError::validation("aggregate tenant id is empty"));
        }
        if self.aggregate_type.is_empty() {
            return Err(EventStoreError::validation("aggregate type is empty"));
        }
        if self.id.is_empty() {
            return Err(EventStoreError::validation("aggregate id is empty"));
        }
        Ok(())
    }
}
