use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::params_from_iter;
use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DbError(pub String);

/// A storage-level scalar. The stores speak SQL text with `?` placeholders
/// and bind these positionally.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Converts a JSON scalar into its storage representation. Booleans are
    /// stored as 0/1; non-scalar values are serialized to their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Integer(i64::from(*flag)),
            Value::Number(number) => {
                if let Some(integer) = number.as_i64() {
                    Self::Integer(integer)
                } else {
                    Self::Real(number.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(text) => Self::Text(text.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Integer(integer) => Value::from(*integer),
            Self::Real(real) => Value::from(*real),
            Self::Text(text) => Value::from(text.clone()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(integer) => Some(*integer),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Self::Integer(integer) => ToSqlOutput::Owned(SqliteValue::Integer(*integer)),
            Self::Real(real) => ToSqlOutput::Owned(SqliteValue::Real(*real)),
            Self::Text(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
        })
    }
}

/// One storage row, keyed by column name.
#[derive(Debug, Clone, Default)]
pub struct Row {
    values: HashMap<String, SqlValue>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(SqlValue::as_text)
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        self.values.get(column).and_then(SqlValue::as_integer)
    }

    /// 0/1 (or absent) coerced to bool.
    pub fn boolean(&self, column: &str) -> bool {
        self.integer(column).unwrap_or(0) != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    pub last_insert_id: i64,
    pub rows_affected: u64,
}

/// The storage collaborator. Parameterized SQL text with `?` placeholders;
/// inserts surface the generated primary key through [`WriteOutcome`].
#[async_trait]
pub trait Database: Send + Sync {
    async fn read(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError>;
    async fn write(&self, sql: &str, params: &[SqlValue]) -> Result<WriteOutcome, DbError>;
}

/// SQLite-backed [`Database`]. One connection behind an async mutex; the
/// store layer above issues short sequential statements, so a single
/// serialized connection is sufficient.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path).map_err(|error| DbError(error.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|error| DbError(error.to_string()))?;
        tracing::debug!(path = %path.display(), "sqlite database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().map_err(|error| DbError(error.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// In-memory SQLite handle, shared as a trait object.
pub fn memory() -> Result<Arc<dyn Database>, DbError> {
    Ok(Arc::new(SqliteDatabase::open_in_memory()?))
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn read(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|error| DbError(error.to_string()))?;
        let columns: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|name| (*name).to_string())
            .collect();
        let mut rows = stmt
            .query(params_from_iter(params.iter()))
            .map_err(|error| DbError(error.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|error| DbError(error.to_string()))? {
            let mut values = HashMap::with_capacity(columns.len());
            for (index, column) in columns.iter().enumerate() {
                let value = match row
                    .get_ref(index)
                    .map_err(|error| DbError(error.to_string()))?
                {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(integer) => SqlValue::Integer(integer),
                    ValueRef::Real(real) => SqlValue::Real(real),
                    ValueRef::Text(text) => {
                        SqlValue::Text(String::from_utf8_lossy(text).into_owned())
                    }
                    // No blob columns in this schema.
                    ValueRef::Blob(_) => SqlValue::Null,
                };
                values.insert(column.clone(), value);
            }
            out.push(Row { values });
        }
        Ok(out)
    }

    async fn write(&self, sql: &str, params: &[SqlValue]) -> Result<WriteOutcome, DbError> {
        let conn = self.conn.lock().await;
        let rows_affected = conn
            .execute(sql, params_from_iter(params.iter()))
            .map_err(|error| DbError(error.to_string()))?;
        Ok(WriteOutcome {
            last_insert_id: conn.last_insert_rowid(),
            rows_affected: rows_affected as u64,
        })
    }
}
