//! Local durable store.
//!
//! A small key/value contract over SQLite tables that all share the
//! `(key, doc, ts)` layout. Every call is one statement (or one transaction)
//! and returns only after SQLite committed it, so a record either lands
//! completely or the call fails with `StorageUnavailable`.

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, ToSql, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, MutexGuard};
use tracing::debug;

use crate::db::DbState;
use crate::error::{PosError, PosResult};

/// Logical tables of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Current order documents keyed by order id.
    Orders,
    /// Pending outbound operations keyed by local sequence number.
    SyncQueue,
    /// Operations the remote rejected for good, keyed by their old sequence.
    Rejections,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Orders => "orders",
            Table::SyncQueue => "sync_queue",
            Table::Rejections => "sync_rejections",
        }
    }

    /// Whether `put` without a key allocates the next sequence number.
    fn assigns_keys(self) -> bool {
        matches!(self, Table::SyncQueue)
    }

    fn accepts(self, key: &RecordKey) -> bool {
        match self {
            Table::Orders => matches!(key, RecordKey::Text(_)),
            Table::SyncQueue | Table::Rejections => matches!(key, RecordKey::Seq(_)),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Text(String),
    Seq(i64),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Text(s) => f.write_str(s),
            RecordKey::Seq(n) => write!(f, "#{n}"),
        }
    }
}

impl ToSql for RecordKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            RecordKey::Text(s) => s.to_sql(),
            RecordKey::Seq(n) => n.to_sql(),
        }
    }
}

/// One stored document. `key` is `None` only for a `put` that asks the table
/// to allocate a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: Option<RecordKey>,
    pub doc: Value,
    /// Ordering timestamp (ms since epoch). Scans return records by `(ts, key)`.
    pub ts: i64,
}

impl StoredRecord {
    pub fn encode<T: Serialize>(key: Option<RecordKey>, value: &T, ts: i64) -> PosResult<Self> {
        Ok(Self {
            key,
            doc: serde_json::to_value(value)?,
            ts,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> PosResult<T> {
        serde_json::from_value(self.doc.clone()).map_err(|e| {
            let key = self
                .key
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            PosError::StorageUnavailable(format!("corrupt record {key}: {e}"))
        })
    }
}

/// Persistence contract shared by the session controller and the dispatcher.
pub trait DurableStore: Send + Sync {
    /// Insert or overwrite a record. Returns the record's key (allocated when
    /// `record.key` is `None` on a sequence table).
    fn put(&self, table: Table, record: StoredRecord) -> PosResult<RecordKey>;

    fn get(&self, table: Table, key: &RecordKey) -> PosResult<Option<StoredRecord>>;

    /// Ordered linear scan, oldest `(ts, key)` first.
    fn scan(&self, table: Table, limit: Option<usize>) -> PosResult<Vec<StoredRecord>>;

    fn get_all(&self, table: Table) -> PosResult<Vec<StoredRecord>> {
        self.scan(table, None)
    }

    /// Returns whether a record was removed.
    fn delete(&self, table: Table, key: &RecordKey) -> PosResult<bool>;

    /// Remove several records at once. Implementations should make this
    /// atomic; the default removes one by one.
    fn delete_many(&self, table: Table, keys: &[RecordKey]) -> PosResult<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(table, key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn count(&self, table: Table) -> PosResult<u64>;

    /// Read-modify-write of one record with no other write in between.
    /// `apply` edits the record in place and returns whether to store it.
    /// Returns `false` when the record is missing or `apply` declined.
    fn update(
        &self,
        table: Table,
        key: &RecordKey,
        apply: &mut dyn FnMut(&mut StoredRecord) -> PosResult<bool>,
    ) -> PosResult<bool>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    db: Arc<DbState>,
}

impl SqliteStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    fn conn(&self) -> PosResult<MutexGuard<'_, rusqlite::Connection>> {
        self.db
            .conn
            .lock()
            .map_err(|e| PosError::StorageUnavailable(format!("db lock poisoned: {e}")))
    }
}

fn key_from_sql(value: ValueRef<'_>) -> rusqlite::Result<RecordKey> {
    match value {
        ValueRef::Integer(n) => Ok(RecordKey::Seq(n)),
        ValueRef::Text(bytes) => Ok(RecordKey::Text(String::from_utf8_lossy(bytes).into_owned())),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            "key".to_string(),
            other.data_type(),
        )),
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(RecordKey, String, i64)> {
    Ok((key_from_sql(row.get_ref(0)?)?, row.get(1)?, row.get(2)?))
}

fn parse_record((key, doc, ts): (RecordKey, String, i64)) -> PosResult<StoredRecord> {
    let doc: Value = serde_json::from_str(&doc)
        .map_err(|e| PosError::StorageUnavailable(format!("corrupt record {key}: {e}")))?;
    Ok(StoredRecord {
        key: Some(key),
        doc,
        ts,
    })
}

impl DurableStore for SqliteStore {
    fn put(&self, table: Table, record: StoredRecord) -> PosResult<RecordKey> {
        let doc = serde_json::to_string(&record.doc)?;
        let conn = self.conn()?;

        match record.key {
            Some(key) => {
                if !table.accepts(&key) {
                    return Err(PosError::Validation(format!(
                        "key {key} is not valid for table {table}"
                    )));
                }
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (key, doc, ts) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET doc = excluded.doc, ts = excluded.ts"
                    ),
                    params![key, doc, record.ts],
                )
                .map_err(|e| PosError::StorageUnavailable(format!("put {table}/{key}: {e}")))?;
                Ok(key)
            }
            None if table.assigns_keys() => {
                conn.execute(
                    &format!("INSERT INTO {table} (doc, ts) VALUES (?1, ?2)"),
                    params![doc, record.ts],
                )
                .map_err(|e| PosError::StorageUnavailable(format!("put {table}: {e}")))?;
                let key = RecordKey::Seq(conn.last_insert_rowid());
                debug!(table = %table, key = %key, "record appended");
                Ok(key)
            }
            None => Err(PosError::Validation(format!(
                "table {table} requires an explicit key"
            ))),
        }
    }

    fn get(&self, table: Table, key: &RecordKey) -> PosResult<Option<StoredRecord>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT key, doc, ts FROM {table} WHERE key = ?1"),
                params![key],
                row_to_record,
            )
            .optional()
            .map_err(|e| PosError::StorageUnavailable(format!("get {table}/{key}: {e}")))?;
        raw.map(parse_record).transpose()
    }

    fn scan(&self, table: Table, limit: Option<usize>) -> PosResult<Vec<StoredRecord>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT key, doc, ts FROM {table} ORDER BY ts ASC, key ASC LIMIT ?1"
            ))
            .map_err(|e| PosError::StorageUnavailable(format!("scan {table}: {e}")))?;
        let rows = stmt
            .query_map(params![limit], row_to_record)
            .map_err(|e| PosError::StorageUnavailable(format!("scan {table}: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PosError::StorageUnavailable(format!("scan {table}: {e}")))?;
        rows.into_iter().map(parse_record).collect()
    }

    fn delete(&self, table: Table, key: &RecordKey) -> PosResult<bool> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                &format!("DELETE FROM {table} WHERE key = ?1"),
                params![key],
            )
            .map_err(|e| PosError::StorageUnavailable(format!("delete {table}/{key}: {e}")))?;
        Ok(removed > 0)
    }

    fn delete_many(&self, table: Table, keys: &[RecordKey]) -> PosResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| PosError::StorageUnavailable(format!("delete {table}: {e}")))?;
        let mut removed = 0;
        {
            let mut stmt = tx
                .prepare(&format!("DELETE FROM {table} WHERE key = ?1"))
                .map_err(|e| PosError::StorageUnavailable(format!("delete {table}: {e}")))?;
            for key in keys {
                removed += stmt
                    .execute(params![key])
                    .map_err(|e| PosError::StorageUnavailable(format!("delete {table}/{key}: {e}")))?;
            }
        }
        tx.commit()
            .map_err(|e| PosError::StorageUnavailable(format!("delete {table}: {e}")))?;
        Ok(removed)
    }

    fn count(&self, table: Table) -> PosResult<u64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .map_err(|e| PosError::StorageUnavailable(format!("count {table}: {e}")))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    fn update(
        &self,
        table: Table,
        key: &RecordKey,
        apply: &mut dyn FnMut(&mut StoredRecord) -> PosResult<bool>,
    ) -> PosResult<bool> {
        let storage =
            |e: rusqlite::Error| PosError::StorageUnavailable(format!("update {table}/{key}: {e}"));
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;
        let raw = tx
            .query_row(
                &format!("SELECT key, doc, ts FROM {table} WHERE key = ?1"),
                params![key],
                row_to_record,
            )
            .optional()
            .map_err(storage)?;
        let Some(raw) = raw else {
            return Ok(false);
        };
        let mut record = parse_record(raw)?;
        if !apply(&mut record)? {
            return Ok(false);
        }
        let doc = serde_json::to_string(&record.doc)?;
        tx.execute(
            &format!("UPDATE {table} SET doc = ?1, ts = ?2 WHERE key = ?3"),
            params![doc, record.ts, key],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;
        Ok(true)
    }
}
