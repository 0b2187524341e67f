//! SQLite-backed store.
//!
//! All collections share one `records` table keyed by `(collection, key)`
//! with the record body stored as JSON text. Expression indexes cover the
//! hot queries: queue items by `(status, created_at)` and upload records by
//! `capture_id`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::{Collection, Filter, LocalStore, OrderBy};
use crate::domain::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    key        TEXT NOT NULL,
    data       TEXT NOT NULL,
    PRIMARY KEY (collection, key)
);

CREATE INDEX IF NOT EXISTS idx_queue_items_status_created
    ON records (json_extract(data, '$.status'), json_extract(data, '$.created_at'))
    WHERE collection = 'queue_items';

CREATE INDEX IF NOT EXISTS idx_upload_records_capture
    ON records (json_extract(data, '$.capture_id'))
    WHERE collection = 'upload_records';
"#;

/// Store backed by a single SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Lock("sqlite connection mutex poisoned".to_string()))
    }
}

/// Field names are inlined into SQL, so only plain identifiers are allowed
fn json_path(field: &str) -> Result<String, StoreError> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StoreError::InvalidQuery(format!(
            "unsupported field name: {:?}",
            field
        )));
    }
    Ok(format!("json_extract(data, '$.{}')", field))
}

fn to_sql_value(value: &Value) -> Result<SqlValue, StoreError> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(SqlValue::Integer(i)),
            None => Ok(SqlValue::Real(n.as_f64().unwrap_or(0.0))),
        },
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        other => Err(StoreError::InvalidQuery(format!(
            "cannot filter on non-scalar value {}",
            other
        ))),
    }
}

/// Build the SELECT for a filtered, ordered query
fn build_query(
    collection: Collection,
    filter: &Filter,
    order_by: &OrderBy,
) -> Result<(String, Vec<SqlValue>), StoreError> {
    let mut sql = String::from("SELECT data FROM records WHERE collection = ?");
    let mut params = vec![SqlValue::Text(collection.as_str().to_string())];

    for (field, value) in filter.conditions() {
        let path = json_path(field)?;
        if value.is_null() {
            sql.push_str(&format!(" AND {} IS NULL", path));
        } else {
            sql.push_str(&format!(" AND {} = ?", path));
            params.push(to_sql_value(value)?);
        }
    }

    let direction = if order_by.ascending { "ASC" } else { "DESC" };
    sql.push_str(&format!(
        " ORDER BY {} {}, key ASC",
        json_path(&order_by.field)?,
        direction
    ));

    Ok((sql, params))
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND key = ?2",
                params![collection.as_str(), key],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, collection: Collection, key: &str, record: Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(&record)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO records (collection, key, data) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, key) DO UPDATE SET data = excluded.data",
            params![collection.as_str(), key, text],
        )?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![collection.as_str(), key],
        )?;
        Ok(removed > 0)
    }

    async fn query_ordered(
        &self,
        collection: Collection,
        filter: &Filter,
        order_by: &OrderBy,
    ) -> Result<Vec<Value>, StoreError> {
        let (sql, params) = build_query(collection, filter, order_by)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }
}
