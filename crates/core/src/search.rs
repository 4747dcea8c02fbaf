//! Search queries over the event log.
//!
//! A query is an OR of groups, each group an AND of per-group filters
//! (aggregate types, aggregate ids, event types, payload field equality).
//! Cross-cutting filters (tenants, resource owners, creators, time bounds,
//! position/sequence lower bounds) restrict the whole query. An absent or empty
//! filter dimension never restricts.
//!
//! ```ignore
//! let query = SearchQueryBuilder::new()
//!     .tenant_ids(["t1"])
//!     .add_query()
//!     .aggregate_types(["user"])
//!     .event_types(["user.created"])
//!     .or()
//!     .aggregate_types(["org"])
//!     .build()
//!     .build()?;
//! ```

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::aggregate::StreamKey;
use crate::error::EventStoreError;
use crate::event::Event;
use crate::id::{AggregateId, AggregateType, EventType, TenantId};

/// Result ordering by aggregate sequence (ties broken by global position).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// One conjunctive filter group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryGroup {
    aggregate_types: Vec<AggregateType>,
    aggregate_ids: Vec<AggregateId>,
    event_types: Vec<EventType>,
    payload: Map<String, JsonValue>,
}

impl QueryGroup {
    pub fn aggregate_types(&self) -> &[AggregateType] {
        &self.aggregate_types
    }

    pub fn aggregate_ids(&self) -> &[AggregateId] {
        &self.aggregate_ids
    }

    pub fn event_types(&self) -> &[EventType] {
        &self.event_types
    }

    /// Top-level payload fields that must equal the given JSON values.
    pub fn payload(&self) -> &Map<String, JsonValue> {
        &self.payload
    }

    fn matches(&self, event: &Event, payload: Option<&JsonValue>) -> bool {
        if !self.aggregate_types.is_empty()
            && !self.aggregate_types.contains(&event.aggregate.aggregate_type)
        {
            return false;
        }
        if !self.aggregate_ids.is_empty() && !self.aggregate_ids.contains(&event.aggregate.id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if self.payload.is_empty() {
            return true;
        }
        let Some(JsonValue::Object(fields)) = payload else {
            return false;
        };
        self.payload
            .iter()
            .all(|(name, expected)| fields.get(name) == Some(expected))
    }
}

/// A validated search query (at least one group).
///
/// Deserializing applies the same check as [`SearchQueryBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSearchQuery")]
pub struct SearchQuery {
    tenant_ids: Vec<TenantId>,
    resource_owners: Vec<String>,
    creators: Vec<String>,
    groups: Vec<QueryGroup>,
    created_after: Option<DateTime<Utc>>,
    created_before: Option<DateTime<Utc>>,
    position_at_least: Option<u64>,
    sequence_at_least: Option<u64>,
    order: SortOrder,
    limit: Option<u64>,
    offset: Option<u64>,
}

#[derive(Deserialize)]
struct RawSearchQuery {
    tenant_ids: Vec<TenantId>,
    resource_owners: Vec<String>,
    creators: Vec<String>,
    groups: Vec<QueryGroup>,
    created_after: Option<DateTime<Utc>>,
    created_before: Option<DateTime<Utc>>,
    position_at_least: Option<u64>,
    sequence_at_least: Option<u64>,
    order: SortOrder,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl TryFrom<RawSearchQuery> for SearchQuery {
    type Error = EventStoreError;

    fn try_from(raw: RawSearchQuery) -> Result<Self, Self::Error> {
        SearchQueryBuilder {
            query: SearchQuery {
                tenant_ids: raw.tenant_ids,
                resource_owners: raw.resource_owners,
                creators: raw.creators,
                groups: raw.groups,
                created_after: raw.created_after,
                created_before: raw.created_before,
                position_at_least: raw.position_at_least,
                sequence_at_least: raw.sequence_at_least,
                order: raw.order,
                limit: raw.limit,
                offset: raw.offset,
            },
        }
        .build()
    }
}

impl SearchQuery {
    /// Every event of a single stream, in sequence order.
    pub fn for_stream(key: &StreamKey) -> Self {
        let mut query = Self::empty();
        query.tenant_ids.push(key.tenant_id.clone());
        query.groups.push(QueryGroup {
            aggregate_types: vec![key.aggregate_type.clone()],
            aggregate_ids: vec![key.aggregate_id.clone()],
            ..QueryGroup::default()
        });
        query
    }

    fn empty() -> Self {
        Self {
            tenant_ids: Vec::new(),
            resource_owners: Vec::new(),
            creators: Vec::new(),
            groups: Vec::new(),
            created_after: None,
            created_before: None,
            position_at_least: None,
            sequence_at_least: None,
            order: SortOrder::Asc,
            limit: None,
            offset: None,
        }
    }

    pub fn tenant_ids(&self) -> &[TenantId] {
        &self.tenant_ids
    }

    pub fn resource_owners(&self) -> &[String] {
        &self.resource_owners
    }

    pub fn creators(&self) -> &[String] {
        &self.creators
    }

    pub fn groups(&self) -> &[QueryGroup] {
        &self.groups
    }

    pub fn created_after(&self) -> Option<DateTime<Utc>> {
        self.created_after
    }

    pub fn created_before(&self) -> Option<DateTime<Utc>> {
        self.created_before
    }

    pub fn position_at_least(&self) -> Option<u64> {
        self.position_at_least
    }

    pub fn sequence_at_least(&self) -> Option<u64> {
        self.sequence_at_least
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Evaluate every filter against a single event.
    pub fn matches(&self, event: &Event) -> bool {
        let aggregate = &event.aggregate;

        if !self.tenant_ids.is_empty() && !self.tenant_ids.contains(&aggregate.tenant_id) {
            return false;
        }
        if !self.resource_owners.is_empty() && !self.resource_owners.contains(&aggregate.resource_owner) {
            return false;
        }
        if !self.creators.is_empty() {
            match &event.creator {
                Some(creator) if self.creators.contains(creator) => {}
                _ => return false,
            }
        }
        if self.created_after.is_some_and(|after| event.created_at < after) {
            return false;
        }
        if self.created_before.is_some_and(|before| event.created_at > before) {
            return false;
        }
        if self.position_at_least.is_some_and(|p| event.global_position < p) {
            return false;
        }
        if self.sequence_at_least.is_some_and(|s| aggregate.sequence < s) {
            return false;
        }

        // Only parse the payload when some group filters on it.
        let payload = if self.groups.iter().any(|g| !g.payload.is_empty()) {
            event.payload_json().ok().flatten()
        } else {
            None
        };

        self.groups.iter().any(|g| g.matches(event, payload.as_ref()))
    }

    /// Order events by aggregate sequence, then global position, in the query's direction.
    pub fn sort(&self, events: &mut [Event]) {
        events.sort_by(|a, b| self.compare(a, b));
    }

    /// Filter, order and paginate an unordered set of events.
    pub fn apply(&self, events: impl IntoIterator<Item = Event>) -> Vec<Event> {
        let mut matched: Vec<Event> = events.into_iter().filter(|e| self.matches(e)).collect();
        self.sort(&mut matched);

        let offset = self.offset.unwrap_or(0) as usize;
        let limit = self.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        matched.into_iter().skip(offset).take(limit).collect()
    }

    /// Compare two events the way this query orders them.
    pub fn compare(&self, a: &Event, b: &Event) -> Ordering {
        let ordering = (a.aggregate.sequence, a.global_position).cmp(&(b.aggregate.sequence, b.global_position));
        match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// Builder for [`SearchQuery`]: cross-cutting filters plus OR-groups.
#[derive(Debug, Clone)]
pub struct SearchQueryBuilder {
    query: SearchQuery,
}

impl Default for SearchQueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchQueryBuilder {
    pub fn new() -> Self {
        Self {
            query: SearchQuery::empty(),
        }
    }

    pub fn tenant_ids<I, T>(mut self, tenant_ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TenantId>,
    {
        self.query.tenant_ids = tenant_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn resource_owners<I, T>(mut self, owners: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.query.resource_owners = owners.into_iter().map(Into::into).collect();
        self
    }

    pub fn creators<I, T>(mut self, creators: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.query.creators = creators.into_iter().map(Into::into).collect();
        self
    }

    /// Inclusive lower bound on `created_at`.
    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.query.created_after = Some(at);
        self
    }

    /// Inclusive upper bound on `created_at`.
    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.query.created_before = Some(at);
        self
    }

    /// Inclusive lower bound on the global position.
    pub fn position_at_least(mut self, position: u64) -> Self {
        self.query.position_at_least = Some(position);
        self
    }

    /// Inclusive lower bound on the per-aggregate sequence.
    pub fn sequence_at_least(mut self, sequence: u64) -> Self {
        self.query.sequence_at_least = Some(sequence);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.query.order = order;
        self
    }

    pub fn asc(self) -> Self {
        self.order(SortOrder::Asc)
    }

    pub fn desc(self) -> Self {
        self.order(SortOrder::Desc)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.query.offset = Some(offset);
        self
    }

    /// Open a new OR-group.
    pub fn add_query(self) -> QueryGroupBuilder {
        QueryGroupBuilder {
            parent: self,
            group: QueryGroup::default(),
        }
    }

    /// Validate and finish the query. A query without groups is a usage error.
    pub fn build(self) -> Result<SearchQuery, EventStoreError> {
        if self.query.groups.is_empty() {
            return Err(EventStoreError::validation(
                "search query needs at least one query group",
            ));
        }
        Ok(self.query)
    }
}

/// Builder for one OR-group of a [`SearchQueryBuilder`].
#[derive(Debug, Clone)]
pub struct QueryGroupBuilder {
    parent: SearchQueryBuilder,
    group: QueryGroup,
}

impl QueryGroupBuilder {
    pub fn aggregate_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        self.group.aggregate_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn aggregate_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateId>,
    {
        self.group.aggregate_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn event_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.group.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Require the top-level payload field `name` to equal `value`.
    pub fn payload_field(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.group.payload.insert(name.into(), value);
        self
    }

    /// Close this group and open the next one.
    pub fn or(self) -> QueryGroupBuilder {
        self.build().add_query()
    }

    /// Close this group and return to the outer builder.
    pub fn build(mut self) -> SearchQueryBuilder {
        self.parent.query.groups.push(self.group);
        self.parent
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::aggregate::{Aggregate, AggregateVersion};

    fn event(tenant: &str, agg_type: &str, id: &str, seq: u64, pos: u64, event_type: &str) -> Event {
        let mut aggregate = Aggregate::new(tenant, agg_type, AggregateVersion::default(), id, "org1");
        aggregate.sequence = seq;
        Event {
            id: Uuid::now_v7(),
            aggregate,
            event_type: event_type.into(),
            payload: Some(br#"{"name":"a","age":3}"#.to_vec()),
            creator: Some("admin".to_string()),
            correlation_id: None,
            causation_id: None,
            global_position: pos,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn zero_groups_is_rejected() {
        let err = SearchQueryBuilder::new().tenant_ids(["t1"]).build().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn tenant_filter_and_group_must_both_match() {
        let query = SearchQueryBuilder::new()
            .tenant_ids(["t1"])
            .add_query()
            .aggregate_types(["user"])
            .build()
            .build()
            .unwrap();

        assert!(query.matches(&event("t1", "user", "u1", 1, 1, "user.created")));
        assert!(!query.matches(&event("t2", "user", "u1", 1, 2, "user.created")));
        assert!(!query.matches(&event("t1", "org", "o1", 1, 3, "org.created")));
    }

    #[test]
    fn groups_are_combined_with_or() {
        let query = SearchQueryBuilder::new()
            .add_query()
            .aggregate_types(["user"])
            .event_types(["user.created"])
            .or()
            .aggregate_types(["org"])
            .build()
            .build()
            .unwrap();

        assert_eq!(query.groups().len(), 2);
        assert!(query.matches(&event("t1", "user", "u1", 1, 1, "user.created")));
        assert!(!query.matches(&event("t1", "user", "u1", 2, 2, "user.renamed")));
        assert!(query.matches(&event("t1", "org", "o1", 1, 3, "org.renamed")));
    }

    #[test]
    fn empty_group_matches_everything() {
        let query = SearchQueryBuilder::new().add_query().build().build().unwrap();
        assert!(query.matches(&event("t9", "x", "y", 7, 7, "z")));
    }

    #[test]
    fn position_and_sequence_bounds_are_inclusive() {
        let query = SearchQueryBuilder::new()
            .position_at_least(10)
            .sequence_at_least(2)
            .add_query()
            .build()
            .build()
            .unwrap();

        assert!(query.matches(&event("t1", "user", "u1", 2, 10, "e")));
        assert!(!query.matches(&event("t1", "user", "u1", 2, 9, "e")));
        assert!(!query.matches(&event("t1", "user", "u1", 1, 10, "e")));
    }

    #[test]
    fn created_bounds_are_inclusive() {
        let e = event("t1", "user", "u1", 1, 1, "e");
        let query = SearchQueryBuilder::new()
            .created_after(e.created_at)
            .created_before(e.created_at)
            .add_query()
            .build()
            .build()
            .unwrap();
        assert!(query.matches(&e));

        let later = SearchQueryBuilder::new()
            .created_after(e.created_at + Duration::seconds(1))
            .add_query()
            .build()
            .build()
            .unwrap();
        assert!(!later.matches(&e));
    }

    #[test]
    fn payload_fields_must_be_equal() {
        let hit = SearchQueryBuilder::new()
            .add_query()
            .payload_field("name", json!("a"))
            .payload_field("age", json!(3))
            .build()
            .build()
            .unwrap();
        let miss = SearchQueryBuilder::new()
            .add_query()
            .payload_field("name", json!("b"))
            .build()
            .build()
            .unwrap();

        let e = event("t1", "user", "u1", 1, 1, "e");
        assert!(hit.matches(&e));
        assert!(!miss.matches(&e));

        let mut no_payload = e.clone();
        no_payload.payload = None;
        assert!(!hit.matches(&no_payload));
    }

    #[test]
    fn owner_and_creator_filters_apply_to_whole_query() {
        let query = SearchQueryBuilder::new()
            .resource_owners(["org2"])
            .add_query()
            .build()
            .build()
            .unwrap();
        assert!(!query.matches(&event("t1", "user", "u1", 1, 1, "e")));

        let query = SearchQueryBuilder::new()
            .creators(["admin"])
            .add_query()
            .build()
            .build()
            .unwrap();
        let mut e = event("t1", "user", "u1", 1, 1, "e");
        assert!(query.matches(&e));
        e.creator = None;
        assert!(!query.matches(&e));
    }

    #[test]
    fn apply_orders_and_paginates() {
        let events = vec![
            event("t1", "user", "u1", 3, 30, "e"),
            event("t1", "user", "u1", 1, 10, "e"),
            event("t1", "user", "u1", 2, 20, "e"),
        ];

        let asc = SearchQueryBuilder::new().add_query().build().build().unwrap();
        let seqs: Vec<u64> = asc.apply(events.clone()).iter().map(Event::sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let page = SearchQueryBuilder::new()
            .desc()
            .offset(1)
            .limit(1)
            .add_query()
            .build()
            .build()
            .unwrap();
        let seqs: Vec<u64> = page.apply(events).iter().map(Event::sequence).collect();
        assert_eq!(seqs, vec![2]);
    }

    #[test]
    fn for_stream_targets_one_stream() {
        let key = StreamKey {
            tenant_id: "t1".into(),
            aggregate_type: "user".into(),
            aggregate_id: "u1".into(),
        };
        let query = SearchQuery::for_stream(&key);
        assert!(query.matches(&event("t1", "user", "u1", 1, 1, "e")));
        assert!(!query.matches(&event("t1", "user", "u2", 1, 2, "e")));
    }

    #[test]
    fn deserializing_rejects_a_query_without_groups() {
        let query = SearchQueryBuilder::new()
            .tenant_ids(["t1"])
            .add_query()
            .aggregate_types(["user"])
            .build()
            .build()
            .unwrap();

        let mut value = serde_json::to_value(&query).unwrap();
        let round_trip: SearchQuery = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(round_trip, query);

        value["groups"] = json!([]);
        let err = serde_json::from_value::<SearchQuery>(value).unwrap_err();
        assert!(err.to_string().contains("at least one query group"));
    }
}
