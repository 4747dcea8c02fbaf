//! Postgres-backed event log.
//!
//! ## Error mapping
//!
//! | SQLSTATE | constraint | `StoreError` |
//! |----------|------------|--------------|
//! | `23505` | `events_pkey` | `StreamConflict` (retried) |
//! | `23505` | anything else | `UniqueViolation` with the server's detail string |
//! | `40001` | n/a | `SerializationFailure` (retried) |
//! | other | n/a | `Database` |
//!
//! ## Payloads
//!
//! `payload` is a `JSON` column, not `JSONB`: Postgres keeps the text as written,
//! so reads return the exact bytes the push produced. Payload field filters cast
//! to `jsonb` for the comparison.
//!
//! ## Ordering
//!
//! `global_position` is an identity column: strictly increasing in insert order,
//! with gaps left by rolled-back transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgDatabaseError, PgRow};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use eventvault_core::{
    Aggregate, AggregateVersion, Event, QueryGroup, SearchQuery, SortOrder, StreamKey,
};

use super::{
    ConstraintDelete, ConstraintKey, InsertedEvent, NewEvent, Store, StoreError, StoreTx,
    StreamHead,
};

const EVENTS_PKEY: &str = "events_pkey";

/// Rows per insert statement; keeps bind parameters well under the protocol limit.
const INSERT_CHUNK: usize = 1_000;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id                 UUID        NOT NULL,
        tenant_id          TEXT        NOT NULL,
        aggregate_type     TEXT        NOT NULL,
        aggregate_id       TEXT        NOT NULL,
        aggregate_version  BIGINT      NOT NULL,
        aggregate_sequence BIGINT      NOT NULL,
        resource_owner     TEXT        NOT NULL,
        event_type         TEXT        NOT NULL,
        payload            JSON,
        creator            TEXT,
        correlation_id     TEXT,
        causation_id       TEXT,
        global_position    BIGINT      GENERATED ALWAYS AS IDENTITY,
        created_at         TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
        CONSTRAINT events_pkey PRIMARY KEY (tenant_id, aggregate_type, aggregate_id, aggregate_sequence)
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS events_global_position_idx ON events (global_position)",
    "CREATE INDEX IF NOT EXISTS events_event_type_idx ON events (tenant_id, aggregate_type, event_type)",
    r#"
    CREATE TABLE IF NOT EXISTS unique_constraints (
        tenant_id    TEXT NOT NULL,
        unique_type  TEXT NOT NULL,
        unique_value TEXT NOT NULL,
        CONSTRAINT unique_constraints_pkey PRIMARY KEY (tenant_id, unique_type, unique_value)
    )
    "#,
];

const SELECT_EVENTS: &str = "SELECT id, tenant_id, aggregate_type, aggregate_id, aggregate_version, \
     aggregate_sequence, resource_owner, event_type, payload::text AS payload, creator, \
     correlation_id, causation_id, global_position, created_at FROM events";

/// Event log stored in Postgres.
///
/// Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `events` and `unique_constraints` tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        Ok(PostgresTx { tx })
    }

    #[instrument(skip(self, query), fields(groups = query.groups().len(), event_count), err)]
    async fn query_events(&self, query: &SearchQuery) -> Result<Vec<Event>, StoreError> {
        let mut qb = compile_search(query);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_events", e))?;

        let events = rows
            .iter()
            .map(|row| {
                EventRow::from_row(row)
                    .map_err(|e| StoreError::Decode(format!("event row: {e}")))
                    .and_then(Event::try_from)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Span::current().record("event_count", events.len());
        Ok(events)
    }
}

/// Open Postgres transaction.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn lock_stream_head(&mut self, key: &StreamKey) -> Result<Option<StreamHead>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_sequence, resource_owner
            FROM events
            WHERE tenant_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
            ORDER BY aggregate_sequence DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(key.tenant_id.as_str())
        .bind(key.aggregate_type.as_str())
        .bind(key.aggregate_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stream_head", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sequence: i64 = row
            .try_get("aggregate_sequence")
            .map_err(|e| StoreError::Decode(format!("aggregate_sequence: {e}")))?;
        let resource_owner: String = row
            .try_get("resource_owner")
            .map_err(|e| StoreError::Decode(format!("resource_owner: {e}")))?;

        Ok(Some(StreamHead {
            sequence: sequence as u64,
            resource_owner,
        }))
    }

    async fn insert_events(&mut self, events: &[NewEvent]) -> Result<Vec<InsertedEvent>, StoreError> {
        let mut inserted = Vec::with_capacity(events.len());

        for chunk in events.chunks(INSERT_CHUNK) {
            let mut qb = compile_insert_events(chunk)?;
            let rows = qb
                .build()
                .fetch_all(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("insert_events", e))?;

            for row in &rows {
                inserted.push(inserted_from_row(row)?);
            }
        }
        debug!(count = inserted.len(), "events inserted");
        Ok(inserted)
    }

    async fn delete_unique_constraints(&mut self, deletes: &[ConstraintDelete]) -> Result<(), StoreError> {
        if deletes.is_empty() {
            return Ok(());
        }
        compile_delete_constraints(deletes)
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_unique_constraints", e))?;
        Ok(())
    }

    async fn insert_unique_constraints(&mut self, keys: &[ConstraintKey]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO unique_constraints (tenant_id, unique_type, unique_value) ",
        );
        qb.push_values(keys, |mut b, key| {
            b.push_bind(key.tenant_id.as_str())
                .push_bind(key.unique_type.as_str())
                .push_bind(key.unique_value.as_str());
        });
        qb.build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_unique_constraints", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

fn compile_insert_events(events: &[NewEvent]) -> Result<QueryBuilder<'_, Postgres>, StoreError> {
    let payloads = events
        .iter()
        .map(|e| {
            e.payload
                .as_deref()
                .map(std::str::from_utf8)
                .transpose()
                .map_err(|err| StoreError::Decode(format!("payload of {}: {err}", e.event_type)))
        })
        .collect::<Result<Vec<Option<&str>>, _>>()?;

    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO events (id, tenant_id, aggregate_type, aggregate_id, aggregate_version, \
         aggregate_sequence, resource_owner, event_type, payload, creator, correlation_id, \
         causation_id) ",
    );
    qb.push_values(events.iter().zip(payloads), |mut b, (event, payload)| {
        let aggregate = &event.aggregate;
        b.push_bind(event.id)
            .push_bind(aggregate.tenant_id.as_str())
            .push_bind(aggregate.aggregate_type.as_str())
            .push_bind(aggregate.id.as_str())
            .push_bind(i64::from(aggregate.version.major()))
            .push_bind(aggregate.sequence as i64)
            .push_bind(aggregate.resource_owner.as_str())
            .push_bind(event.event_type.as_str())
            .push_bind(payload)
            .push_unseparated("::json")
            .push_bind(event.creator.as_deref())
            .push_bind(event.correlation_id.as_deref())
            .push_bind(event.causation_id.as_deref());
    });
    qb.push(" RETURNING tenant_id, aggregate_type, aggregate_id, aggregate_sequence, global_position, created_at");
    Ok(qb)
}

fn compile_delete_constraints(deletes: &[ConstraintDelete]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM unique_constraints WHERE ");
    for (i, delete) in deletes.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        match delete {
            ConstraintDelete::Key(key) => {
                qb.push("(tenant_id = ")
                    .push_bind(key.tenant_id.as_str())
                    .push(" AND unique_type = ")
                    .push_bind(key.unique_type.as_str())
                    .push(" AND unique_value = ")
                    .push_bind(key.unique_value.as_str())
                    .push(")");
            }
            ConstraintDelete::Tenant(tenant_id) => {
                qb.push("(tenant_id = ").push_bind(tenant_id.as_str()).push(")");
            }
        }
    }
    qb
}

/// Compile a search query into a single SELECT.
pub(crate) fn compile_search(query: &SearchQuery) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new(SELECT_EVENTS);

    qb.push(" WHERE (");
    for (i, group) in query.groups().iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        push_group(&mut qb, group);
    }
    qb.push(")");

    if !query.tenant_ids().is_empty() {
        let tenants: Vec<String> = query.tenant_ids().iter().map(|t| t.to_string()).collect();
        qb.push(" AND tenant_id = ANY(").push_bind(tenants).push(")");
    }
    if !query.resource_owners().is_empty() {
        qb.push(" AND resource_owner = ANY(")
            .push_bind(query.resource_owners().to_vec())
            .push(")");
    }
    if !query.creators().is_empty() {
        qb.push(" AND creator = ANY(")
            .push_bind(query.creators().to_vec())
            .push(")");
    }
    if let Some(after) = query.created_after() {
        qb.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = query.created_before() {
        qb.push(" AND created_at <= ").push_bind(before);
    }
    if let Some(position) = query.position_at_least() {
        qb.push(" AND global_position >= ").push_bind(bind_u64(position));
    }
    if let Some(sequence) = query.sequence_at_least() {
        qb.push(" AND aggregate_sequence >= ").push_bind(bind_u64(sequence));
    }

    match query.order() {
        SortOrder::Asc => qb.push(" ORDER BY aggregate_sequence ASC, global_position ASC"),
        SortOrder::Desc => qb.push(" ORDER BY aggregate_sequence DESC, global_position DESC"),
    };
    if let Some(limit) = query.limit() {
        qb.push(" LIMIT ").push_bind(bind_u64(limit));
    }
    if let Some(offset) = query.offset() {
        qb.push(" OFFSET ").push_bind(bind_u64(offset));
    }
    qb
}

fn push_group<'a>(qb: &mut QueryBuilder<'a, Postgres>, group: &'a QueryGroup) {
    let mut conditions = 0;
    qb.push("(");
    {
        let mut sep = qb.separated(" AND ");

        if !group.aggregate_types().is_empty() {
            let types: Vec<String> = group.aggregate_types().iter().map(ToString::to_string).collect();
            sep.push("aggregate_type = ANY(")
                .push_bind_unseparated(types)
                .push_unseparated(")");
            conditions += 1;
        }
        if !group.aggregate_ids().is_empty() {
            let ids: Vec<String> = group.aggregate_ids().iter().map(ToString::to_string).collect();
            sep.push("aggregate_id = ANY(")
                .push_bind_unseparated(ids)
                .push_unseparated(")");
            conditions += 1;
        }
        if !group.event_types().is_empty() {
            let types: Vec<String> = group.event_types().iter().map(ToString::to_string).collect();
            sep.push("event_type = ANY(")
                .push_bind_unseparated(types)
                .push_unseparated(")");
            conditions += 1;
        }
        for (field, value) in group.payload() {
            sep.push("(payload::jsonb -> ")
                .push_bind_unseparated(field.as_str())
                .push_unseparated(") = ")
                .push_bind_unseparated(value.to_string())
                .push_unseparated("::jsonb");
            conditions += 1;
        }
        if conditions == 0 {
            sep.push("TRUE");
        }
    }
    qb.push(")");
}

/// `BIGINT` bind for an unsigned bound; values past `i64::MAX` saturate.
fn bind_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Map SQLx errors to [`StoreError`].
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => {
                let constraint = db_err.constraint().map(str::to_owned);
                if constraint.as_deref() == Some(EVENTS_PKEY) {
                    return StoreError::StreamConflict(format!(
                        "{operation}: {}",
                        db_err.message()
                    ));
                }
                let detail = db_err
                    .try_downcast_ref::<PgDatabaseError>()
                    .and_then(PgDatabaseError::detail)
                    .unwrap_or_else(|| db_err.message())
                    .to_owned();
                return StoreError::UniqueViolation { constraint, detail };
            }
            Some("40001") => {
                return StoreError::SerializationFailure(format!(
                    "{operation}: {}",
                    db_err.message()
                ));
            }
            _ => {}
        }
    }
    StoreError::database(operation, err)
}

fn inserted_from_row(row: &PgRow) -> Result<InsertedEvent, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(format!("inserted event row: {e}"));
    let sequence: i64 = row.try_get("aggregate_sequence").map_err(decode)?;
    let position: i64 = row.try_get("global_position").map_err(decode)?;

    Ok(InsertedEvent {
        stream: StreamKey {
            tenant_id: row.try_get::<String, _>("tenant_id").map_err(decode)?.into(),
            aggregate_type: row.try_get::<String, _>("aggregate_type").map_err(decode)?.into(),
            aggregate_id: row.try_get::<String, _>("aggregate_id").map_err(decode)?.into(),
        },
        sequence: sequence as u64,
        global_position: position as u64,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    id: Uuid,
    tenant_id: String,
    aggregate_type: String,
    aggregate_id: String,
    aggregate_version: i64,
    aggregate_sequence: i64,
    resource_owner: String,
    event_type: String,
    payload: Option<String>,
    creator: Option<String>,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    global_position: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_version: row.try_get("aggregate_version")?,
            aggregate_sequence: row.try_get("aggregate_sequence")?,
            resource_owner: row.try_get("resource_owner")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            creator: row.try_get("creator")?,
            correlation_id: row.try_get("correlation_id")?,
            causation_id: row.try_get("causation_id")?,
            global_position: row.try_get("global_position")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let major = u32::try_from(row.aggregate_version)
            .map_err(|_| StoreError::Decode(format!("aggregate_version {}", row.aggregate_version)))?;

        let mut aggregate = Aggregate::new(
            row.tenant_id,
            row.aggregate_type,
            AggregateVersion::from_major(major),
            row.aggregate_id,
            row.resource_owner,
        );
        aggregate.sequence = row.aggregate_sequence as u64;

        Ok(Event {
            id: row.id,
            aggregate,
            event_type: row.event_type.into(),
            payload: row.payload.map(String::into_bytes),
            creator: row.creator,
            correlation_id: row.correlation_id,
            causation_id: row.causation_id,
            global_position: row.global_position as u64,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use eventvault_core::SearchQueryBuilder;

    #[test]
    fn search_compiles_groups_with_or_and_filters_with_and() {
        let query = SearchQueryBuilder::new()
            .tenant_ids(["t1"])
            .position_at_least(5)
            .add_query()
            .aggregate_types(["user"])
            .event_types(["user.created"])
            .or()
            .aggregate_ids(["o1"])
            .payload_field("name", json!("a"))
            .build()
            .build()
            .unwrap();

        let qb = compile_search(&query);
        let sql = qb.sql();

        assert!(sql.starts_with(SELECT_EVENTS));
        assert!(sql.contains(
            "WHERE ((aggregate_type = ANY($1) AND event_type = ANY($2)) OR \
             (aggregate_id = ANY($3) AND (payload::jsonb -> $4) = $5::jsonb))"
        ));
        assert!(sql.contains(" AND tenant_id = ANY($6)"));
        assert!(sql.contains(" AND global_position >= $7"));
        assert!(sql.ends_with(" ORDER BY aggregate_sequence ASC, global_position ASC"));
    }

    #[test]
    fn empty_group_compiles_to_true_and_desc_paging() {
        let query = SearchQueryBuilder::new()
            .desc()
            .limit(10)
            .offset(20)
            .add_query()
            .build()
            .build()
            .unwrap();

        let qb = compile_search(&query);
        let sql = qb.sql();
        assert!(sql.contains("WHERE ((TRUE))"));
        assert!(sql.contains("ORDER BY aggregate_sequence DESC, global_position DESC LIMIT $1 OFFSET $2"));
    }

    #[test]
    fn tenant_remove_deletes_whole_scope() {
        let deletes = vec![
            ConstraintDelete::Key(ConstraintKey {
                tenant_id: "t1".into(),
                unique_type: "email".into(),
                unique_value: "a".into(),
            }),
            ConstraintDelete::Tenant("t2".into()),
        ];
        let qb = compile_delete_constraints(&deletes);
        assert_eq!(
            qb.sql(),
            "DELETE FROM unique_constraints WHERE \
             (tenant_id = $1 AND unique_type = $2 AND unique_value = $3) OR (tenant_id = $4)"
        );
    }

    #[test]
    fn insert_binds_payload_as_json_and_returns_assigned_columns() {
        let mut aggregate = Aggregate::new("t1", "user", AggregateVersion::default(), "u1", "org1");
        aggregate.sequence = 1;
        let events = vec![NewEvent {
            id: Uuid::now_v7(),
            aggregate,
            event_type: "user.created".into(),
            payload: Some(br#"{"name":"a"}"#.to_vec()),
            creator: None,
            correlation_id: None,
            causation_id: None,
        }];

        let qb = compile_insert_events(&events).unwrap();
        let sql = qb.sql();
        assert!(sql.contains("$9::json,"));
        assert!(sql.ends_with("RETURNING tenant_id, aggregate_type, aggregate_id, aggregate_sequence, global_position, created_at"));
    }

    fn row(version: u32, payload: &str) -> EventRow {
        EventRow {
            id: Uuid::now_v7(),
            tenant_id: "t1".into(),
            aggregate_type: "user".into(),
            aggregate_id: "u1".into(),
            aggregate_version: i64::from(version),
            aggregate_sequence: 1,
            resource_owner: "org1".into(),
            event_type: "user.created".into(),
            payload: Some(payload.into()),
            creator: None,
            correlation_id: None,
            causation_id: None,
            global_position: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn largest_major_version_survives_storage() {
        let version: AggregateVersion = "v4294967295".parse().unwrap();
        let event = Event::try_from(row(version.major(), "{}")).unwrap();
        assert_eq!(event.aggregate.version.major(), u32::MAX);
    }

    #[test]
    fn payload_text_is_returned_unchanged() {
        let written = r#"{ "b": 1,  "a": 2 }"#;
        let event = Event::try_from(row(1, written)).unwrap();
        assert_eq!(event.payload.as_deref(), Some(written.as_bytes()));
    }

    #[test]
    fn oversized_bounds_saturate_instead_of_wrapping() {
        assert_eq!(bind_u64(u64::MAX), i64::MAX);
        assert_eq!(bind_u64(i64::MAX as u64 + 1), i64::MAX);
        assert_eq!(bind_u64(20), 20);
    }
}
