//! Persistence of records with unique ids.
//!
//! Adds id-keyed reads and writes on top of [`Persistence`]: lookups by id,
//! upserts, full and partial updates and deletes. Missing rows are reported
//! as `None`, never as errors.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use serde_json::Value;
use tracing::trace;

use crate::config::PersistenceConfig;
use crate::connection::ConnectionManager;
use crate::data::{DataPage, PagingParams, Row};
use crate::error::Result;
use crate::mapper::{ensure_id, ColumnMapper, Identifiable, RowMapper, ID_COLUMN};
use crate::persistence::{LifecycleState, Persistence};
use crate::resolver::{CredentialStore, Discovery};
use crate::sql::{placeholders, quote_identifier, set_clause, values, InsertFragments};

/// Id-keyed CRUD protocol shared by every identifiable persistence.
#[async_trait]
pub trait IdentifiableStore<T: Identifiable>: Send + Sync {
    async fn get_one_by_id(&self, trace_id: &str, id: &T::Id) -> Result<Option<T>>;

    async fn get_list_by_ids(&self, trace_id: &str, ids: &[T::Id]) -> Result<Vec<T>>;

    async fn create(&self, trace_id: &str, record: &T) -> Result<T>;

    async fn set(&self, trace_id: &str, record: &T) -> Result<Option<T>>;

    async fn update(&self, trace_id: &str, record: &T) -> Result<Option<T>>;

    async fn update_partially(&self, trace_id: &str, id: &T::Id, partial: Row) -> Result<Option<T>>;

    async fn delete_by_id(&self, trace_id: &str, id: &T::Id) -> Result<Option<T>>;

    async fn delete_by_ids(&self, trace_id: &str, ids: &[T::Id]) -> Result<()>;
}

/// Table persistence keyed by the `"id"` column.
pub struct IdentifiablePersistence<T, M = ColumnMapper<T>> {
    base: Persistence<T, M>,
}

impl<T, M> IdentifiablePersistence<T, M>
where
    T: Identifiable,
    M: RowMapper<T> + Default,
{
    pub fn new(config: &PersistenceConfig) -> Self {
        Self {
            base: Persistence::new(config),
        }
    }
}

impl<T, M> IdentifiablePersistence<T, M>
where
    T: Identifiable,
    M: RowMapper<T>,
{
    pub fn with_mapper(config: &PersistenceConfig, mapper: M) -> Self {
        Self {
            base: Persistence::with_mapper(config, mapper),
        }
    }

    pub fn with_connection(self, manager: Arc<dyn ConnectionManager>) -> Self {
        Self {
            base: self.base.with_connection(manager),
        }
    }

    pub fn with_local_connection(self, manager: Arc<dyn ConnectionManager>) -> Self {
        Self {
            base: self.base.with_local_connection(manager),
        }
    }

    pub fn with_discovery(self, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            base: self.base.with_discovery(discovery),
        }
    }

    pub fn with_credential_store(self, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            base: self.base.with_credential_store(store),
        }
    }

    pub fn with_rng(self, rng: StdRng) -> Self {
        Self {
            base: self.base.with_rng(rng),
        }
    }

    /// The underlying table persistence, for filter-based operations.
    pub fn base(&self) -> &Persistence<T, M> {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut Persistence<T, M> {
        &mut self.base
    }

    pub fn state(&self) -> LifecycleState {
        self.base.state()
    }

    pub fn is_open(&self) -> bool {
        self.base.is_open()
    }

    pub async fn open(&self, trace_id: &str) -> Result<()> {
        self.base.open(trace_id).await
    }

    pub async fn close(&self, trace_id: &str) -> Result<()> {
        self.base.close(trace_id).await
    }

    pub async fn clear(&self, trace_id: &str) -> Result<()> {
        self.base.clear(trace_id).await
    }

    pub async fn get_page_by_filter(
        &self,
        trace_id: &str,
        filter: Option<&str>,
        paging: Option<PagingParams>,
        sort: Option<&str>,
        projection: Option<&str>,
    ) -> Result<DataPage<T>> {
        self.base
            .get_page_by_filter(trace_id, filter, paging, sort, projection)
            .await
    }

    pub async fn get_count_by_filter(&self, trace_id: &str, filter: Option<&str>) -> Result<i64> {
        self.base.get_count_by_filter(trace_id, filter).await
    }

    pub async fn get_list_by_filter(
        &self,
        trace_id: &str,
        filter: Option<&str>,
        sort: Option<&str>,
        projection: Option<&str>,
    ) -> Result<Vec<T>> {
        self.base
            .get_list_by_filter(trace_id, filter, sort, projection)
            .await
    }

    pub async fn get_one_random(&self, trace_id: &str, filter: Option<&str>) -> Result<Option<T>> {
        self.base.get_one_random(trace_id, filter).await
    }

    pub async fn delete_by_filter(&self, trace_id: &str, filter: Option<&str>) -> Result<()> {
        self.base.delete_by_filter(trace_id, filter).await
    }

    fn id_column() -> String {
        quote_identifier(ID_COLUMN)
    }

    fn id_values(ids: &[T::Id]) -> Result<Vec<Value>> {
        ids.iter()
            .map(|id| serde_json::to_value(id).map_err(Into::into))
            .collect()
    }

    pub async fn get_one_by_id(&self, trace_id: &str, id: &T::Id) -> Result<Option<T>> {
        let query = format!(
            "SELECT * FROM {} WHERE {}=$1",
            self.base.quoted_table()?,
            Self::id_column()
        );
        let rows = self
            .base
            .execute(trace_id, &query, &[serde_json::to_value(id)?])
            .await?;

        let item = self.base.to_public_first(rows)?;
        if item.is_some() {
            trace!(trace_id, table = self.base.table()?, id = ?id, "retrieved item by id");
        } else {
            trace!(trace_id, table = self.base.table()?, id = ?id, "nothing found by id");
        }
        Ok(item)
    }

    /// Get the records with the given ids, in database order.
    pub async fn get_list_by_ids(&self, trace_id: &str, ids: &[T::Id]) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT * FROM {} WHERE {} IN({})",
            self.base.quoted_table()?,
            Self::id_column(),
            placeholders(ids.len())
        );
        let rows = self
            .base
            .execute(trace_id, &query, &Self::id_values(ids)?)
            .await?;
        trace!(trace_id, table = self.base.table()?, count = rows.len(), "retrieved items by ids");
        self.base.to_public_all(rows)
    }

    /// Insert a record, generating its id when it has none.
    pub async fn create(&self, trace_id: &str, record: &T) -> Result<T> {
        let mut record = record.clone();
        ensure_id(&mut record);
        self.base.create(trace_id, &record).await
    }

    /// Insert the record or replace the row with the same id.
    pub async fn set(&self, trace_id: &str, record: &T) -> Result<Option<T>> {
        let mut record = record.clone();
        ensure_id(&mut record);

        let row = self.base.mapper().from_public(&record)?;
        let fragments = InsertFragments::from_row(&row)?;
        let query = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {} RETURNING *",
            self.base.quoted_table()?,
            fragments.columns,
            fragments.placeholders,
            Self::id_column(),
            fragments.set_clause
        );

        let rows = self.base.execute(trace_id, &query, &fragments.values).await?;
        let item = self.base.to_public_first(rows)?;
        trace!(trace_id, table = self.base.table()?, id = ?record.id(), "set item");
        Ok(item)
    }

    /// Replace the row with the record's id. `None` when the record has no
    /// id or no such row exists.
    pub async fn update(&self, trace_id: &str, record: &T) -> Result<Option<T>> {
        let Some(id) = record.id() else {
            return Ok(None);
        };

        let row = self.base.mapper().from_public(record)?;
        let (set, names) = set_clause(&row);
        let mut params = values(&names, &row)?;
        params.push(serde_json::to_value(id)?);

        let query = format!(
            "UPDATE {} SET {} WHERE {}=${} RETURNING *",
            self.base.quoted_table()?,
            set,
            Self::id_column(),
            params.len()
        );
        let rows = self.base.execute(trace_id, &query, &params).await?;
        let item = self.base.to_public_first(rows)?;
        if item.is_some() {
            trace!(trace_id, table = self.base.table()?, id = ?id, "updated item");
        }
        Ok(item)
    }

    /// Update only the given fields of the row with `id`. An empty field map
    /// changes nothing and returns the current record.
    pub async fn update_partially(&self, trace_id: &str, id: &T::Id, partial: Row) -> Result<Option<T>> {
        if partial.is_empty() {
            return self.get_one_by_id(trace_id, id).await;
        }

        let table = self.base.quoted_table()?;
        let query = self
            .base
            .mapper()
            .partial_update(&table, serde_json::to_value(id)?, partial)?;
        let rows = self
            .base
            .execute(trace_id, &query.statement, &query.params)
            .await?;

        let item = self.base.to_public_first(rows)?;
        if item.is_some() {
            trace!(trace_id, table = self.base.table()?, id = ?id, "updated item partially");
        }
        Ok(item)
    }

    /// Delete the row with `id` and return what it held.
    pub async fn delete_by_id(&self, trace_id: &str, id: &T::Id) -> Result<Option<T>> {
        let query = format!(
            "DELETE FROM {} WHERE {}=$1 RETURNING *",
            self.base.quoted_table()?,
            Self::id_column()
        );
        let rows = self
            .base
            .execute(trace_id, &query, &[serde_json::to_value(id)?])
            .await?;

        let item = self.base.to_public_first(rows)?;
        if item.is_some() {
            trace!(trace_id, table = self.base.table()?, id = ?id, "deleted item");
        }
        Ok(item)
    }

    pub async fn delete_by_ids(&self, trace_id: &str, ids: &[T::Id]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let query = format!(
            "DELETE FROM {} WHERE {} IN({})",
            self.base.quoted_table()?,
            Self::id_column(),
            placeholders(ids.len())
        );
        self.base
            .execute(trace_id, &query, &Self::id_values(ids)?)
            .await?;
        trace!(trace_id, table = self.base.table()?, count = ids.len(), "deleted items by ids");
        Ok(())
    }
}

#[async_trait]
impl<T, M> IdentifiableStore<T> for IdentifiablePersistence<T, M>
where
    T: Identifiable + 'static,
    M: RowMapper<T> + 'static,
{
    async fn get_one_by_id(&self, trace_id: &str, id: &T::Id) -> Result<Option<T>> {
        IdentifiablePersistence::get_one_by_id(self, trace_id, id).await
    }

    async fn get_list_by_ids(&self, trace_id: &str, ids: &[T::Id]) -> Result<Vec<T>> {
        IdentifiablePersistence::get_list_by_ids(self, trace_id, ids).await
    }

    async fn create(&self, trace_id: &str, record: &T) -> Result<T> {
        IdentifiablePersistence::create(self, trace_id, record).await
    }

    async fn set(&self, trace_id: &str, record: &T) -> Result<Option<T>> {
        IdentifiablePersistence::set(self, trace_id, record).await
    }

    async fn update(&self, trace_id: &str, record: &T) -> Result<Option<T>> {
        IdentifiablePersistence::update(self, trace_id, record).await
    }

    async fn update_partially(&self, trace_id: &str, id: &T::Id, partial: Row) -> Result<Option<T>> {
        IdentifiablePersistence::update_partially(self, trace_id, id, partial).await
    }

    async fn delete_by_id(&self, trace_id: &str, id: &T::Id) -> Result<Option<T>> {
        IdentifiablePersistence::delete_by_id(self, trace_id, id).await
    }

    async fn delete_by_ids(&self, trace_id: &str, ids: &[T::Id]) -> Result<()> {
        IdentifiablePersistence::delete_by_ids(self, trace_id, ids).await
    }
}
