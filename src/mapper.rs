//! Conversions between public records and stored rows.

use std::fmt::Debug;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::data::Row;
use crate::error::{PersistenceError, Result};
use crate::sql::{quote_identifier, set_clause, to_row, values, SqlQuery};

/// Column holding the record id.
pub const ID_COLUMN: &str = "id";

/// Column holding the JSON document in JSON-column tables.
pub const DATA_COLUMN: &str = "data";

/// Conversion hooks between a record type and its table rows.
pub trait RowMapper<T>: Send + Sync {
    /// Decode a returned database row into a record.
    fn to_public(&self, row: Row) -> Result<T>;

    /// Encode a record into the row written to the table.
    fn from_public(&self, record: &T) -> Result<Row>;

    /// Encode a partial field map used by partial updates.
    fn from_public_partial(&self, partial: Row) -> Result<Row> {
        Ok(partial)
    }

    /// Build the statement that writes `partial` into the row with `id`.
    /// `table` is already quoted. The default sets one column per field.
    fn partial_update(&self, table: &str, id: Value, partial: Row) -> Result<SqlQuery> {
        let row = self.from_public_partial(partial)?;
        let (set, names) = set_clause(&row);
        let mut params = values(&names, &row)?;
        params.push(id);
        Ok(SqlQuery::new(
            format!(
                "UPDATE {table} SET {set} WHERE {}=${} RETURNING *",
                quote_identifier(ID_COLUMN),
                params.len()
            ),
            params,
        ))
    }
}

/// Record fields map 1:1 onto table columns.
pub struct ColumnMapper<T> {
    _record: PhantomData<fn() -> T>,
}

impl<T> ColumnMapper<T> {
    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<T> Default for ColumnMapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RowMapper<T> for ColumnMapper<T>
where
    T: Serialize + DeserializeOwned,
{
    fn to_public(&self, row: Row) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }

    fn from_public(&self, record: &T) -> Result<Row> {
        to_row(record)
    }
}

/// Whole record stored as one JSON document beside its id:
/// `{"id": <record id>, "data": <record>}`.
pub struct JsonColumnMapper<T> {
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonColumnMapper<T> {
    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<T> Default for JsonColumnMapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RowMapper<T> for JsonColumnMapper<T>
where
    T: Identifiable + Serialize + DeserializeOwned,
{
    fn to_public(&self, mut row: Row) -> Result<T> {
        let data = row
            .remove(DATA_COLUMN)
            .ok_or_else(|| PersistenceError::Shape(format!("row has no {DATA_COLUMN} column")))?;
        // Some drivers hand json columns back as text.
        let data = match data {
            Value::String(text) => serde_json::from_str(&text)?,
            other => other,
        };
        Ok(serde_json::from_value(data)?)
    }

    fn from_public(&self, record: &T) -> Result<Row> {
        let data = Value::Object(to_row(record)?);
        let id = serde_json::to_value(record.id())?;

        let mut row = Row::new();
        row.insert(ID_COLUMN.to_string(), id);
        row.insert(DATA_COLUMN.to_string(), data);
        Ok(row)
    }

    /// Merges the fields into the stored document instead of rewriting it.
    fn partial_update(&self, table: &str, id: Value, partial: Row) -> Result<SqlQuery> {
        let data = quote_identifier(DATA_COLUMN);
        Ok(SqlQuery::new(
            format!(
                "UPDATE {table} SET {data} = {data} || $2 WHERE {} = $1 RETURNING *",
                quote_identifier(ID_COLUMN)
            ),
            vec![id, Value::Object(partial)],
        ))
    }
}

/// A record carrying a unique identifier.
pub trait Identifiable: Clone + Send + Sync {
    type Id: IdGenerator + Serialize + Clone + Debug + Send + Sync;

    fn id(&self) -> Option<&Self::Id>;

    fn set_id(&mut self, id: Self::Id);
}

/// Id types that can generate fresh values for new records.
pub trait IdGenerator: Sized {
    fn generate() -> Self;
}

impl IdGenerator for String {
    fn generate() -> Self {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

impl IdGenerator for uuid::Uuid {
    fn generate() -> Self {
        uuid::Uuid::new_v4()
    }
}

/// Give the record a generated id unless it already has one.
pub fn ensure_id<T: Identifiable>(record: &mut T) {
    if record.id().is_none() {
        record.set_id(T::Id::generate());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Dummy {
        id: Option<String>,
        key: String,
    }

    impl Identifiable for Dummy {
        type Id = String;

        fn id(&self) -> Option<&String> {
            self.id.as_ref()
        }

        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }
    }

    #[test]
    fn generates_missing_ids_only() {
        let mut dummy = Dummy { id: None, key: "k".into() };
        ensure_id(&mut dummy);
        let generated = dummy.id.clone().unwrap();
        assert_eq!(generated.len(), 32);

        ensure_id(&mut dummy);
        assert_eq!(dummy.id, Some(generated));
    }

    #[test]
    fn json_mapper_wraps_record() {
        let mapper = JsonColumnMapper::<Dummy>::new();
        let dummy = Dummy { id: Some("1".into()), key: "k".into() };
        let row = mapper.from_public(&dummy).unwrap();
        assert_eq!(
            Value::Object(row),
            json!({"id": "1", "data": {"id": "1", "key": "k"}})
        );
    }

    #[test]
    fn json_mapper_reads_object_or_text() {
        let mapper = JsonColumnMapper::<Dummy>::new();
        let expected = Dummy { id: Some("1".into()), key: "k".into() };

        let mut row = Row::new();
        row.insert("id".into(), json!("1"));
        row.insert("data".into(), json!({"id": "1", "key": "k"}));
        assert_eq!(mapper.to_public(row).unwrap(), expected);

        let mut row = Row::new();
        row.insert("data".into(), json!(r#"{"id":"1","key":"k"}"#));
        assert_eq!(mapper.to_public(row).unwrap(), expected);
    }

    #[test]
    fn partial_update_statements() {
        let mut partial = Row::new();
        partial.insert("key".into(), json!("new"));
        partial.insert("content".into(), json!("text"));

        let columns = ColumnMapper::<Dummy>::new()
            .partial_update("\"dummies\"", json!("1"), partial.clone())
            .unwrap();
        assert_eq!(
            columns.statement,
            "UPDATE \"dummies\" SET \"key\"=$1,\"content\"=$2 WHERE \"id\"=$3 RETURNING *"
        );
        assert_eq!(columns.params, vec![json!("new"), json!("text"), json!("1")]);

        let merged = JsonColumnMapper::<Dummy>::new()
            .partial_update("\"dummies\"", json!("1"), partial)
            .unwrap();
        assert_eq!(
            merged.statement,
            "UPDATE \"dummies\" SET \"data\" = \"data\" || $2 WHERE \"id\" = $1 RETURNING *"
        );
        assert_eq!(
            merged.params,
            vec![json!("1"), json!({"key": "new", "content": "text"})]
        );
    }

    #[test]
    fn column_mapper_rejects_mismatched_rows() {
        let mapper = ColumnMapper::<Dummy>::new();
        let mut row = Row::new();
        row.insert("id".into(), json!("1"));
        assert!(matches!(mapper.to_public(row), Err(PersistenceError::Shape(_))));
    }
}
