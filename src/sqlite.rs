//! Embedded connection manager backed by SQLite.
//!
//! Runs the statements this crate generates against a local SQLite database,
//! for development and tests without a PostgreSQL server. The PostgreSQL
//! constructs the engine emits are rewritten before execution:
//!
//! - `$n` parameters become `?n`
//! - `OFFSET a LIMIT b` becomes `LIMIT b OFFSET a`
//! - the `to_regclass` existence probe becomes a `sqlite_master` lookup
//! - `"col" || $n` JSON merges become `json_patch("col", ?n)`
//!
//! JSON values bind as SQLite values: booleans as integers, arrays and objects
//! as JSON text. Rows decode by declared column type, so `BOOL`/`BOOLEAN`
//! columns read back as booleans and `JSON`/`JSONB` columns as parsed JSON.
//!
//! `json_patch` follows RFC 7396 rather than PostgreSQL's `jsonb ||`: a null
//! field in a partial update removes the key instead of storing `null`, and
//! nested objects merge recursively instead of being replaced.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Statement};
use serde_json::{Number, Value};
use tracing::info;

use crate::connection::{ConnectionDescriptor, ConnectionManager};
use crate::data::Row;

pub const MEMORY_DATABASE: &str = ":memory:";

/// SQLite connection implementing [`ConnectionManager`].
///
/// The descriptor's `database` is used as the file path; `:memory:` (or no
/// database at all) opens an in-memory database.
#[derive(Default)]
pub struct SqliteConnection {
    conn: Mutex<Option<Connection>>,
    path: Mutex<Option<String>>,
}

impl SqliteConnection {
    /// A closed connection, to be opened with a descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// An already opened in-memory database.
    pub fn in_memory() -> anyhow::Result<Self> {
        Self::open_path(MEMORY_DATABASE)
    }

    /// An already opened database at `path`.
    pub fn open_path(path: &str) -> anyhow::Result<Self> {
        let connection = Self::new();
        connection.connect(path)?;
        Ok(connection)
    }

    fn connect(&self, path: &str) -> anyhow::Result<()> {
        let conn = if path == MEMORY_DATABASE {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        *self.conn.lock() = Some(conn);
        *self.path.lock() = Some(path.to_string());
        info!(path, "sqlite database opened");
        Ok(())
    }
}

#[async_trait]
impl ConnectionManager for SqliteConnection {
    async fn open(&self, trace_id: &str, descriptor: &ConnectionDescriptor) -> anyhow::Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let path = descriptor
            .database
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(MEMORY_DATABASE);
        info!(trace_id, path, "opening sqlite database");
        self.connect(path)
    }

    async fn close(&self, trace_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| e)?;
            info!(trace_id, "sqlite database closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    async fn execute(&self, query: &str, params: &[Value]) -> anyhow::Result<Vec<Row>> {
        let sql = translate(query);
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| anyhow!("sqlite connection is not opened"))?;

        let mut stmt = conn.prepare(&sql)?;
        let columns = column_types(conn, &stmt, &sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql_value)))?;

        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Row::new();
            for (idx, (name, decl_type)) in columns.iter().enumerate() {
                let value: SqlValue = row.get(idx)?;
                map.insert(name.clone(), from_sql_value(value, decl_type.as_deref()));
            }
            result.push(map);
        }
        Ok(result)
    }

    fn database_name(&self) -> Option<String> {
        self.path.lock().clone()
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Result column names with their declared types.
///
/// `RETURNING` columns may come back without a declared type; those are
/// looked up in the schema of the statement's target table.
fn column_types(
    conn: &Connection,
    stmt: &Statement<'_>,
    sql: &str,
) -> rusqlite::Result<Vec<(String, Option<String>)>> {
    let mut columns: Vec<(String, Option<String>)> = stmt
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
        .collect();

    if columns.iter().any(|(_, t)| t.is_none()) {
        if let Some(table) = returning_table(sql) {
            let declared = table_types(conn, &table)?;
            for (name, decl_type) in columns.iter_mut().filter(|(_, t)| t.is_none()) {
                *decl_type = declared.get(name.as_str()).cloned();
            }
        }
    }
    Ok(columns)
}

fn table_types(conn: &Connection, table: &str) -> rusqlite::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare(&format!(
        "PRAGMA table_info(\"{}\")",
        table.replace('"', "\"\"")
    ))?;
    let types = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(types)
}

/// Target table of an `INSERT`, `UPDATE` or `DELETE` with a `RETURNING` clause.
fn returning_table(sql: &str) -> Option<String> {
    if !sql.contains(" RETURNING ") {
        return None;
    }
    let rest = ["INSERT INTO ", "UPDATE ", "DELETE FROM "]
        .iter()
        .find_map(|prefix| sql.trim_start().strip_prefix(prefix))?;

    let name = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split(|c: char| c.is_whitespace() || c == '(').next()?,
    };
    (!name.is_empty()).then(|| name.to_string())
}

fn from_sql_value(value: SqlValue, decl_type: Option<&str>) -> Value {
    let decl_type = decl_type.map(str::to_ascii_uppercase);
    match (value, decl_type.as_deref()) {
        (SqlValue::Integer(i), Some("BOOL" | "BOOLEAN")) => Value::Bool(i != 0),
        (SqlValue::Text(s), Some("JSON" | "JSONB")) => match serde_json::from_str(&s) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(s),
        },
        (value, _) => from_plain_value(value),
    }
}

fn from_plain_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Number(i.into()),
        SqlValue::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
    }
}

/// Rewrite generated PostgreSQL statements into SQLite syntax.
pub fn translate(query: &str) -> String {
    if let Some(probe) = translate_regclass(query) {
        return probe;
    }
    let merged = translate_json_merge(query);
    let numbered = translate_parameters(&merged);
    translate_offset_limit(&numbered)
}

fn translate_regclass(query: &str) -> Option<String> {
    let literal = query
        .trim()
        .strip_prefix("SELECT to_regclass('")?
        .strip_suffix("')")?;
    let name = literal.replace("''", "'");
    let name = name.trim_matches('"');
    Some(format!(
        "SELECT (SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name = '{}') AS to_regclass",
        name.replace('\'', "''")
    ))
}

fn translate_json_merge(query: &str) -> String {
    const OPERATOR: &str = " || $";
    let mut out = String::with_capacity(query.len());
    let mut rest = query;

    while let Some(pos) = rest.find(OPERATOR) {
        let (head, tail) = rest.split_at(pos);
        let digits: String = tail[OPERATOR.len()..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        let column_start = head
            .strip_suffix('"')
            .and_then(|h| h.rfind('"'));

        match column_start {
            Some(start) if !digits.is_empty() => {
                out.push_str(&head[..start]);
                out.push_str(&format!("json_patch({}, ${digits})", &head[start..]));
                rest = &tail[OPERATOR.len() + digits.len()..];
            }
            _ => {
                out.push_str(head);
                out.push_str(OPERATOR);
                rest = &tail[OPERATOR.len()..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn translate_parameters(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut in_literal = false;
    let mut chars = query.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '$' if !in_literal && chars.peek().is_some_and(char::is_ascii_digit) => out.push('?'),
            _ => out.push(c),
        }
    }
    out
}

fn translate_offset_limit(query: &str) -> String {
    let Some(pos) = query.rfind(" OFFSET ") else {
        return query.to_string();
    };
    let tail = &query[pos + " OFFSET ".len()..];
    let Some((offset, limit)) = tail.split_once(" LIMIT ") else {
        return query.to_string();
    };
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !numeric(offset) || !numeric(limit.trim()) {
        return query.to_string();
    }
    format!("{} LIMIT {} OFFSET {}", &query[..pos], limit.trim(), offset)
}
