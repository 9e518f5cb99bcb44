//! Cassandra / ScyllaDB adapter (wide-column side) over CQL.
//!
//! Expected tables:
//!
//! ```text
//! CREATE TABLE <table> (<id> text|uuid PRIMARY KEY, <version> bigint, <fields>...);
//! CREATE TABLE <changes_table> (
//!     time_shard int, cluster_shard int, timestamp bigint, id text, version bigint,
//!     PRIMARY KEY ((time_shard, cluster_shard), timestamp, id, version)
//! ) WITH default_time_to_live = <changelog_ttl_secs>;
//! ```
//!
//! With `conditional_write: compare_and_set` the record table also needs a
//! `<tombstone_column> boolean`. Deletes then keep the row with its version
//! and the flag set, so a late upsert carrying an older version is still
//! rejected by the `IF version < ?` condition. Scans and fetches skip
//! tombstoned rows.
//!
//! Full scans walk the Murmur3 token ring; slice `i/N` owns an equal share of
//! it. Conditional writes either carry a write timestamp derived from the
//! version (unlogged batch, last-write-wins) or go through lightweight
//! transactions on the version column, depending on `conditional_write`.

use std::sync::Arc;

use async_trait::async_trait;
use scylla::batch::{Batch, BatchType};
use scylla::frame::response::result::{CqlValue, Row};
use scylla::prepared_statement::PreparedStatement;
use scylla::transport::errors::{DbError, QueryError};
use scylla::{Session, SessionBuilder};
use tracing::{debug, info};

use super::traits::{ScanCursor, ScanPage, ScanSlice, StorageError, SyncStore, WriteOp, WriteOutcome};
use crate::changelog::{ChangeCursor, ChangeLogEntry, ChangePage, ShardKey, TimeWindow};
use crate::config::{CassandraSettings, ConditionalWrite, VersionUnit};
use crate::record::{Document, FieldValue, IdKind, Record, RecordSchema};
use crate::resilience::retry::{retry_store_call, RetryConfig};

type Values = Vec<Option<CqlValue>>;

/// Statement text for one table layout, before preparation.
#[derive(Debug)]
struct Cql {
    scan: String,
    fetch: String,
    changes_first: String,
    changes_after: String,
    record_change: String,
    writes: Writes<String>,
}

/// Write statements differ per conditional-write mode.
#[derive(Debug)]
enum Writes<S> {
    Timestamped {
        upsert_at: S,
        delete_at: S,
    },
    CompareAndSet {
        insert_if_absent: S,
        update_if_older: S,
        tombstone_if_absent: S,
        tombstone_if_older: S,
    },
}

struct Statements {
    scan: PreparedStatement,
    fetch: PreparedStatement,
    changes_first: PreparedStatement,
    changes_after: PreparedStatement,
    record_change: PreparedStatement,
    writes: Writes<PreparedStatement>,
}

pub struct CassandraStore {
    session: Arc<Session>,
    schema: RecordSchema,
    version_unit: VersionUnit,
    statements: Statements,
}

impl CassandraStore {
    /// Open a session (startup-mode retry) and prepare every statement.
    pub async fn connect(
        settings: &CassandraSettings,
        schema: RecordSchema,
        conditional_write: ConditionalWrite,
        version_unit: VersionUnit,
    ) -> Result<Self, StorageError> {
        let session = retry_store_call("cassandra_connect", &RetryConfig::startup(), || async {
            SessionBuilder::new()
                .known_nodes(&settings.hosts)
                .use_keyspace(&settings.keyspace, false)
                .build()
                .await
                .map_err(|e| StorageError::Transient(e.to_string()))
        })
        .await?;

        let cql = build_cql(settings, &schema, conditional_write);
        let statements = prepare_all(&session, cql).await?;
        info!(
            hosts = ?settings.hosts,
            keyspace = %settings.keyspace,
            table = %settings.table,
            ?conditional_write,
            "Connected to Cassandra"
        );

        Ok(Self {
            session: Arc::new(session),
            schema,
            version_unit,
            statements,
        })
    }

    /// Append a change-log entry (application write path).
    pub async fn record_change(&self, entry: &ChangeLogEntry) -> Result<(), StorageError> {
        let values: Values = vec![
            Some(CqlValue::Int(i32::from(entry.key.time_shard))),
            Some(CqlValue::Int(entry.key.cluster_shard as i32)),
            Some(CqlValue::BigInt(entry.timestamp)),
            Some(CqlValue::Text(entry.id.clone())),
            Some(CqlValue::BigInt(entry.version)),
        ];
        self.session
            .execute(&self.statements.record_change, values)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    fn tombstones(&self) -> bool {
        matches!(self.statements.writes, Writes::CompareAndSet { .. })
    }

    fn id_value(&self, id: &str) -> Result<CqlValue, StorageError> {
        match self.schema.id_kind {
            IdKind::String => Ok(CqlValue::Text(id.to_string())),
            IdKind::Uuid => uuid::Uuid::parse_str(id)
                .map(CqlValue::Uuid)
                .map_err(|e| StorageError::Backend(format!("identity '{}' is not a UUID: {}", id, e))),
        }
    }

    /// `id, version, fields...` bound in `RecordSchema::columns` order.
    fn row_values(&self, record: &Record) -> Result<Values, StorageError> {
        let mut values = vec![Some(self.id_value(&record.id)?), Some(CqlValue::BigInt(record.version))];
        for name in self.schema.sync_fields.keys() {
            values.push(record.fields.get(name).and_then(field_to_cql));
        }
        Ok(values)
    }

    fn row_to_document(&self, row: Row) -> Document {
        self.schema
            .columns()
            .into_iter()
            .zip(row.columns)
            .map(|(name, value)| (name.to_string(), value.map_or(FieldValue::Null, cql_to_field)))
            .collect()
    }

    async fn write_timestamped(
        &self,
        upsert_at: &PreparedStatement,
        delete_at: &PreparedStatement,
        ops: &[WriteOp],
    ) -> Result<Vec<WriteOutcome>, StorageError> {
        let mut batch = Batch::new(BatchType::Unlogged);
        let mut values: Vec<Values> = Vec::with_capacity(ops.len());
        for op in ops {
            let timestamp = Some(CqlValue::BigInt(self.version_unit.to_write_timestamp(op.version())));
            match op {
                WriteOp::Upsert(record) => {
                    batch.append_statement(upsert_at.clone());
                    let mut row = self.row_values(record)?;
                    row.push(timestamp);
                    values.push(row);
                }
                WriteOp::Delete { id, .. } => {
                    batch.append_statement(delete_at.clone());
                    values.push(vec![timestamp, Some(self.id_value(id)?)]);
                }
            }
        }
        self.session.batch(&batch, values).await.map_err(query_error)?;
        // Last-write-wins: an older version lands under an older cell timestamp and loses
        Ok(vec![WriteOutcome::Applied; ops.len()])
    }

    /// Conditional update, falling back to a conditional insert when the row
    /// does not exist yet. Both steps bind `values` built by `update` / `insert`.
    async fn update_or_insert(
        &self,
        update_if_older: &PreparedStatement,
        update: Values,
        insert_if_absent: &PreparedStatement,
        insert: Values,
    ) -> Result<WriteOutcome, StorageError> {
        let result = self
            .session
            .execute(update_if_older, update)
            .await
            .map_err(query_error)?;
        match lwt_result(result.rows.unwrap_or_default()) {
            (true, _) => Ok(WriteOutcome::Applied),
            (false, Some(_)) => Ok(WriteOutcome::RejectedStale),
            (false, None) => {
                let result = self
                    .session
                    .execute(insert_if_absent, insert)
                    .await
                    .map_err(query_error)?;
                match lwt_result(result.rows.unwrap_or_default()) {
                    (true, _) => Ok(WriteOutcome::Applied),
                    // Someone inserted between our two statements
                    (false, _) => Ok(WriteOutcome::RejectedConflict),
                }
            }
        }
    }

    async fn write_compare_and_set(
        &self,
        statements: CasStatements<'_>,
        op: &WriteOp,
    ) -> Result<WriteOutcome, StorageError> {
        match op {
            WriteOp::Upsert(record) => {
                // SET fields..., version, tombstone = false WHERE id IF version < ?
                let row = self.row_values(record)?;
                let mut update: Values = row[2..].to_vec();
                update.push(row[1].clone());
                update.push(row[0].clone());
                update.push(Some(CqlValue::BigInt(record.version)));
                self.update_or_insert(statements.update_if_older, update, statements.insert_if_absent, row)
                    .await
            }
            WriteOp::Delete { id, version } => {
                // SET fields = null, version, tombstone = true WHERE id IF version < ?
                let id = Some(self.id_value(id)?);
                let version = Some(CqlValue::BigInt(*version));
                let update: Values = vec![version.clone(), id.clone(), version.clone()];
                let insert: Values = vec![id, version];
                self.update_or_insert(statements.tombstone_if_older, update, statements.tombstone_if_absent, insert)
                    .await
            }
        }
    }
}

#[derive(Clone, Copy)]
struct CasStatements<'a> {
    insert_if_absent: &'a PreparedStatement,
    update_if_older: &'a PreparedStatement,
    tombstone_if_absent: &'a PreparedStatement,
    tombstone_if_older: &'a PreparedStatement,
}

fn build_cql(settings: &CassandraSettings, schema: &RecordSchema, mode: ConditionalWrite) -> Cql {
    let table = &settings.table;
    let changes = &settings.changes_table;
    let columns = schema.columns();
    let column_list = columns.join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let id = &schema.id_field;
    let version = &schema.version_field;
    let fields = || schema.sync_fields.keys().map(String::as_str);

    let changes_first = format!(
        "SELECT timestamp, id, version FROM {changes} WHERE time_shard = ? AND cluster_shard = ? \
         AND timestamp > ? AND timestamp <= ? LIMIT ?"
    );
    let changes_after = format!(
        "SELECT timestamp, id, version FROM {changes} WHERE time_shard = ? AND cluster_shard = ? \
         AND (timestamp, id, version) > (?, ?, ?) AND (timestamp) <= (?) LIMIT ?"
    );
    let record_change =
        format!("INSERT INTO {changes} (time_shard, cluster_shard, timestamp, id, version) VALUES (?, ?, ?, ?, ?)");

    match mode {
        ConditionalWrite::Timestamp => Cql {
            scan: format!(
                "SELECT {column_list}, token({id}) FROM {table} WHERE token({id}) > ? AND token({id}) <= ? LIMIT ?"
            ),
            fetch: format!("SELECT {column_list} FROM {table} WHERE {id} IN ?"),
            changes_first,
            changes_after,
            record_change,
            writes: Writes::Timestamped {
                upsert_at: format!("INSERT INTO {table} ({column_list}) VALUES ({placeholders}) USING TIMESTAMP ?"),
                delete_at: format!("DELETE FROM {table} USING TIMESTAMP ? WHERE {id} = ?"),
            },
        },
        ConditionalWrite::CompareAndSet => {
            let tomb = &settings.tombstone_column;
            let assignments = fields()
                .chain(std::iter::once(version.as_str()))
                .map(|c| format!("{} = ?", c))
                .collect::<Vec<_>>()
                .join(", ");
            let cleared = fields()
                .map(|c| format!("{} = null, ", c))
                .collect::<String>();
            Cql {
                scan: format!(
                    "SELECT {column_list}, {tomb}, token({id}) FROM {table} \
                     WHERE token({id}) > ? AND token({id}) <= ? LIMIT ?"
                ),
                fetch: format!("SELECT {column_list}, {tomb} FROM {table} WHERE {id} IN ?"),
                changes_first,
                changes_after,
                record_change,
                writes: Writes::CompareAndSet {
                    insert_if_absent: format!(
                        "INSERT INTO {table} ({column_list}, {tomb}) VALUES ({placeholders}, false) IF NOT EXISTS"
                    ),
                    update_if_older: format!(
                        "UPDATE {table} SET {assignments}, {tomb} = false WHERE {id} = ? IF {version} < ?"
                    ),
                    tombstone_if_absent: format!(
                        "INSERT INTO {table} ({id}, {version}, {tomb}) VALUES (?, ?, true) IF NOT EXISTS"
                    ),
                    tombstone_if_older: format!(
                        "UPDATE {table} SET {cleared}{version} = ?, {tomb} = true WHERE {id} = ? IF {version} < ?"
                    ),
                },
            }
        }
    }
}

async fn prepare(session: &Session, cql: String) -> Result<PreparedStatement, StorageError> {
    debug!(cql = %cql, "Preparing statement");
    session.prepare(cql).await.map_err(query_error)
}

async fn prepare_all(session: &Session, cql: Cql) -> Result<Statements, StorageError> {
    let writes = match cql.writes {
        Writes::Timestamped { upsert_at, delete_at } => Writes::Timestamped {
            upsert_at: prepare(session, upsert_at).await?,
            delete_at: prepare(session, delete_at).await?,
        },
        Writes::CompareAndSet {
            insert_if_absent,
            update_if_older,
            tombstone_if_absent,
            tombstone_if_older,
        } => Writes::CompareAndSet {
            insert_if_absent: prepare(session, insert_if_absent).await?,
            update_if_older: prepare(session, update_if_older).await?,
            tombstone_if_absent: prepare(session, tombstone_if_absent).await?,
            tombstone_if_older: prepare(session, tombstone_if_older).await?,
        },
    };
    Ok(Statements {
        scan: prepare(session, cql.scan).await?,
        fetch: prepare(session, cql.fetch).await?,
        changes_first: prepare(session, cql.changes_first).await?,
        changes_after: prepare(session, cql.changes_after).await?,
        record_change: prepare(session, cql.record_change).await?,
        writes,
    })
}

fn query_error(e: QueryError) -> StorageError {
    let transient = matches!(
        &e,
        QueryError::TimeoutError
            | QueryError::RequestTimeout(_)
            | QueryError::IoError(_)
            | QueryError::DbError(
                DbError::Unavailable { .. }
                    | DbError::Overloaded
                    | DbError::IsBootstrapping
                    | DbError::ReadTimeout { .. }
                    | DbError::WriteTimeout { .. },
                _
            )
    );
    if transient {
        StorageError::Transient(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

/// `[applied]` flag of a lightweight transaction, and the stored version it saw.
fn lwt_result(rows: Vec<Row>) -> (bool, Option<i64>) {
    let Some(row) = rows.into_iter().next() else {
        return (false, None);
    };
    let applied = matches!(row.columns.first(), Some(Some(CqlValue::Boolean(true))));
    let seen = match row.columns.get(1) {
        Some(Some(CqlValue::BigInt(v))) => Some(*v),
        _ => None,
    };
    (applied, seen)
}

fn field_to_cql(value: &FieldValue) -> Option<CqlValue> {
    match value {
        FieldValue::Null => None,
        FieldValue::Int(i) => Some(CqlValue::BigInt(*i)),
        FieldValue::Float(f) => Some(CqlValue::Double(*f)),
        FieldValue::Str(s) => Some(CqlValue::Text(s.clone())),
    }
}

fn cql_to_field(value: CqlValue) -> FieldValue {
    match value {
        CqlValue::Text(s) | CqlValue::Ascii(s) => FieldValue::Str(s),
        CqlValue::BigInt(i) => FieldValue::Int(i),
        CqlValue::Int(i) => FieldValue::Int(i64::from(i)),
        CqlValue::SmallInt(i) => FieldValue::Int(i64::from(i)),
        CqlValue::TinyInt(i) => FieldValue::Int(i64::from(i)),
        CqlValue::Double(f) => FieldValue::Float(f),
        CqlValue::Float(f) => FieldValue::Float(f64::from(f)),
        CqlValue::Uuid(u) => FieldValue::Str(u.to_string()),
        _ => FieldValue::Null,
    }
}

/// Token range `(lower, upper]` owned by a scan slice.
fn token_range(slice: ScanSlice) -> (i64, i64) {
    let span = 1i128 << 64;
    let count = i128::from(slice.count.max(1));
    let bound = |i: i128| (i64::MIN as i128 + span * i / count).clamp(i64::MIN as i128, i64::MAX as i128) as i64;
    let lower = bound(i128::from(slice.index));
    let upper = if i128::from(slice.index) + 1 >= count {
        i64::MAX
    } else {
        bound(i128::from(slice.index) + 1)
    };
    (lower, upper)
}

fn limit_value(limit: usize) -> Option<CqlValue> {
    Some(CqlValue::Int(i32::try_from(limit).unwrap_or(i32::MAX)))
}

/// Strip the trailing tombstone column of a tombstone-aware read.
/// Returns `None` for a deleted row.
fn live_row(mut row: Row, tombstones: bool) -> Option<Row> {
    if !tombstones {
        return Some(row);
    }
    match row.columns.pop() {
        Some(Some(CqlValue::Boolean(true))) => None,
        _ => Some(row),
    }
}

fn change_row(key: ShardKey, row: Row) -> Result<ChangeLogEntry, StorageError> {
    match row.columns.as_slice() {
        [Some(CqlValue::BigInt(timestamp)), Some(id), Some(CqlValue::BigInt(version))] => {
            let id = match cql_to_field(id.clone()) {
                FieldValue::Str(s) => s,
                FieldValue::Int(i) => i.to_string(),
                other => {
                    return Err(StorageError::Backend(format!(
                        "unreadable change-log id in {:?}: {:?}",
                        key, other
                    )))
                }
            };
            Ok(ChangeLogEntry {
                key,
                timestamp: *timestamp,
                id,
                version: *version,
            })
        }
        columns => Err(StorageError::Backend(format!(
            "unreadable change-log row in {:?}: {:?}",
            key, columns
        ))),
    }
}

#[async_trait]
impl SyncStore for CassandraStore {
    fn name(&self) -> &str {
        "cassandra"
    }

    async fn scan_page(
        &self,
        slice: ScanSlice,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<ScanPage, StorageError> {
        let (lower, upper) = token_range(slice);
        let lower = match cursor {
            Some(c) => c
                .as_str()
                .parse::<i64>()
                .map_err(|e| StorageError::InvalidCursor(format!("{}: {}", c.as_str(), e)))?,
            None => lower,
        };

        let values: Values = vec![Some(CqlValue::BigInt(lower)), Some(CqlValue::BigInt(upper)), limit_value(limit)];
        let result = self
            .session
            .execute(&self.statements.scan, values)
            .await
            .map_err(query_error)?;
        let rows = result.rows.unwrap_or_default();
        // Tombstoned rows still count towards the page so the cursor moves past them
        let full_page = rows.len() >= limit;
        let tombstones = self.tombstones();

        let mut last_token = None;
        let mut documents = Vec::with_capacity(rows.len());
        for mut row in rows {
            if let Some(Some(CqlValue::BigInt(token))) = row.columns.pop() {
                last_token = Some(token);
            }
            if let Some(row) = live_row(row, tombstones) {
                documents.push(self.row_to_document(row));
            }
        }

        let next = match last_token {
            Some(token) if full_page && token < upper => Some(ScanCursor::new(token.to_string())),
            _ => None,
        };
        Ok(ScanPage { documents, next })
    }

    async fn read_changes(
        &self,
        key: ShardKey,
        window: TimeWindow,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, StorageError> {
        let partition = [
            Some(CqlValue::Int(i32::from(key.time_shard))),
            Some(CqlValue::Int(key.cluster_shard as i32)),
        ];
        let (statement, values): (_, Values) = match after {
            None => (
                &self.statements.changes_first,
                partition
                    .into_iter()
                    .chain([
                        Some(CqlValue::BigInt(window.after)),
                        Some(CqlValue::BigInt(window.upto)),
                        limit_value(limit),
                    ])
                    .collect(),
            ),
            Some(cursor) => (
                &self.statements.changes_after,
                partition
                    .into_iter()
                    .chain([
                        Some(CqlValue::BigInt(cursor.timestamp)),
                        Some(CqlValue::Text(cursor.id.clone())),
                        Some(CqlValue::BigInt(cursor.version)),
                        Some(CqlValue::BigInt(window.upto)),
                        limit_value(limit),
                    ])
                    .collect(),
            ),
        };

        let result = self.session.execute(statement, values).await.map_err(query_error)?;
        let rows = result.rows.unwrap_or_default();
        let full_page = rows.len() >= limit;
        let rows = rows
            .into_iter()
            .map(|row| change_row(key, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ChangePage::from_rows(rows, full_page))
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys = ids.iter().map(|id| self.id_value(id)).collect::<Result<Vec<_>, _>>()?;
        let result = self
            .session
            .execute(&self.statements.fetch, vec![Some(CqlValue::List(keys))])
            .await
            .map_err(query_error)?;
        let tombstones = self.tombstones();
        Ok(result
            .rows
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| live_row(row, tombstones))
            .map(|row| self.row_to_document(row))
            .collect())
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, StorageError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        match &self.statements.writes {
            Writes::Timestamped { upsert_at, delete_at } => self.write_timestamped(upsert_at, delete_at, ops).await,
            Writes::CompareAndSet {
                insert_if_absent,
                update_if_older,
                tombstone_if_absent,
                tombstone_if_older,
            } => {
                let statements = CasStatements {
                    insert_if_absent,
                    update_if_older,
                    tombstone_if_absent,
                    tombstone_if_older,
                };
                // Lightweight transactions cannot share a batch across partitions
                let mut outcomes = Vec::with_capacity(ops.len());
                for op in ops {
                    outcomes.push(match self.write_compare_and_set(statements, op).await {
                        Ok(outcome) => outcome,
                        Err(StorageError::Backend(reason)) => WriteOutcome::Failed(reason),
                        Err(e) => return Err(e),
                    });
                }
                Ok(outcomes)
            }
        }
    }
}
