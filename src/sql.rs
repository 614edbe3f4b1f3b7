//! SQL fragment generation from record rows.
//!
//! Every fragment is derived from a [`Row`], whose key order is the record's
//! field declaration order (or map insertion order). Column lists, placeholder
//! lists, SET clauses and value lists built from the same row line up by
//! position; [`values`] takes the column order explicitly so callers can never
//! pair a clause with values read in a different order.

use serde::Serialize;
use serde_json::Value;

use crate::data::Row;
use crate::error::{PersistenceError, Result};

/// Wrap an identifier in double quotes unless it already starts with one.
pub fn quote_identifier(value: &str) -> String {
    if value.is_empty() || value.starts_with('"') {
        return value.to_string();
    }
    format!("\"{value}\"")
}

/// Quote a string as an SQL text literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Serialize a record into a row. Fails for anything that is not keyed.
pub fn to_row<T: Serialize + ?Sized>(record: &T) -> Result<Row> {
    match serde_json::to_value(record)? {
        Value::Object(row) => Ok(row),
        other => Err(PersistenceError::Shape(format!(
            "expected a keyed record, got {}",
            kind_of(&other)
        ))),
    }
}

/// `"col1","col2",...` in row order.
pub fn columns(row: &Row) -> String {
    row.keys()
        .map(|k| quote_identifier(k))
        .collect::<Vec<_>>()
        .join(",")
}

/// `$1,$2,...,$count`.
pub fn placeholders(count: usize) -> String {
    placeholders_from(1, count)
}

/// `$start,...,$(start+count-1)`.
pub fn placeholders_from(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// `"col1"=$1,"col2"=$2,...` plus the column order it was built with.
pub fn set_clause(row: &Row) -> (String, Vec<String>) {
    let names: Vec<String> = row.keys().cloned().collect();
    let clause = names
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{}=${}", quote_identifier(name), i + 1))
        .collect::<Vec<_>>()
        .join(",");
    (clause, names)
}

/// Values of `row` in exactly the order of `names`.
pub fn values(names: &[String], row: &Row) -> Result<Vec<Value>> {
    names
        .iter()
        .map(|name| {
            row.get(name)
                .cloned()
                .ok_or_else(|| PersistenceError::Shape(format!("column {name} is missing")))
        })
        .collect()
}

/// A statement with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub statement: String,
    pub params: Vec<Value>,
}

impl SqlQuery {
    pub fn new(statement: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            statement: statement.into(),
            params,
        }
    }
}

/// Insert fragments taken from one row snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertFragments {
    pub columns: String,
    pub placeholders: String,
    pub set_clause: String,
    pub values: Vec<Value>,
}

impl InsertFragments {
    pub fn from_row(row: &Row) -> Result<Self> {
        let (set_clause, names) = set_clause(row);
        Ok(Self {
            columns: columns(row),
            placeholders: placeholders(names.len()),
            values: values(&names, row)?,
            set_clause,
        })
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
