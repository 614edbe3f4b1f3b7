//! Identifiable persistence over a two-column JSON table.
//!
//! The table holds the id and the whole record as one JSON document:
//! `("id" <id type> PRIMARY KEY, "data" <json type>)`. Reads return the
//! document, writes store it whole, and partial updates merge fields into
//! the stored document with the `||` operator.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::identifiable::IdentifiablePersistence;
use crate::mapper::{Identifiable, JsonColumnMapper, DATA_COLUMN, ID_COLUMN};
use crate::sql::quote_identifier;

pub const DEFAULT_ID_TYPE: &str = "TEXT";
pub const DEFAULT_DATA_TYPE: &str = "JSONB";

pub type IdentifiableJsonPersistence<T> = IdentifiablePersistence<T, JsonColumnMapper<T>>;

impl<T> IdentifiablePersistence<T, JsonColumnMapper<T>>
where
    T: Identifiable + Serialize + DeserializeOwned,
{
    /// Queue creation of the id/data table. Types default to `TEXT` and `JSONB`.
    pub fn ensure_table(&mut self, id_type: Option<&str>, data_type: Option<&str>) -> Result<()> {
        let id_type = id_type.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_ID_TYPE);
        let data_type = data_type.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_DATA_TYPE);

        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} {id_type} PRIMARY KEY, {} {data_type})",
            self.base().quoted_table()?,
            quote_identifier(ID_COLUMN),
            quote_identifier(DATA_COLUMN)
        );
        self.base_mut().ensure_schema(statement);
        Ok(())
    }
}
