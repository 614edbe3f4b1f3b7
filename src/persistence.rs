//! Generic table persistence.
//!
//! [`Persistence`] stores records of any serde-compatible shape in one table.
//! It owns the open/close lifecycle, provisions the table on first open and
//! provides the filter-based reads and writes that concrete persistences build
//! their public operations from. Filters, sort expressions and projections are
//! trusted SQL text composed by the caller.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::{debug, error, trace};

use crate::config::PersistenceConfig;
use crate::connection::ConnectionManager;
use crate::data::{DataPage, PagingParams, Row};
use crate::error::{PersistenceError, Result};
use crate::mapper::{ColumnMapper, RowMapper};
use crate::resolver::{ConnectionResolver, CredentialStore, Discovery};
use crate::sql::{quote_identifier, quote_literal, InsertFragments};

/// Lifecycle of a persistence component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Closed,
    Opening,
    Open,
    Closing,
}

struct BoundConnection {
    manager: Arc<dyn ConnectionManager>,
    /// Opened and closed by this persistence rather than by its supplier.
    local: bool,
}

/// Persistence of records of type `T` in a single table.
pub struct Persistence<T, M = ColumnMapper<T>> {
    table: Option<String>,
    max_page_size: usize,
    mapper: M,
    resolver: ConnectionResolver,
    connection: Option<BoundConnection>,
    auto_objects: Vec<String>,
    state: Mutex<LifecycleState>,
    client: RwLock<Option<Arc<dyn ConnectionManager>>>,
    rng: Mutex<StdRng>,
    _record: PhantomData<fn() -> T>,
}

impl<T, M> Persistence<T, M>
where
    T: Send + Sync,
    M: RowMapper<T> + Default,
{
    pub fn new(config: &PersistenceConfig) -> Self {
        Self::with_mapper(config, M::default())
    }
}

impl<T, M> Persistence<T, M>
where
    T: Send + Sync,
    M: RowMapper<T>,
{
    pub fn with_mapper(config: &PersistenceConfig, mapper: M) -> Self {
        Self {
            table: config.table_name().map(str::to_string),
            max_page_size: config.options.max_page_size,
            mapper,
            resolver: ConnectionResolver::new(config),
            connection: None,
            auto_objects: Vec::new(),
            state: Mutex::new(LifecycleState::Closed),
            client: RwLock::new(None),
            rng: Mutex::new(StdRng::from_entropy()),
            _record: PhantomData,
        }
    }

    /// Use a connection manager owned by someone else. It is never opened or
    /// closed by this persistence.
    pub fn with_connection(mut self, manager: Arc<dyn ConnectionManager>) -> Self {
        self.set_connection(manager, false);
        self
    }

    /// Use a connection manager owned by this persistence. It is opened with
    /// a freshly resolved descriptor on every open and closed on close.
    pub fn with_local_connection(mut self, manager: Arc<dyn ConnectionManager>) -> Self {
        self.set_connection(manager, true);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.resolver.set_discovery(discovery);
        self
    }

    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.resolver.set_credential_store(store);
        self
    }

    /// Replace the random source used by [`Self::get_one_random`].
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn set_connection(&mut self, manager: Arc<dyn ConnectionManager>, local: bool) {
        self.connection = Some(BoundConnection { manager, local });
    }

    pub fn unset_connection(&mut self) {
        self.connection = None;
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    /// Configured table name.
    pub fn table(&self) -> Result<&str> {
        self.table
            .as_deref()
            .ok_or_else(|| PersistenceError::config("NO_TABLE", "table name is not defined"))
    }

    /// Configured table name, quoted for use in SQL text.
    pub fn quoted_table(&self) -> Result<String> {
        self.table().map(quote_identifier)
    }

    /// Queue a DDL statement to run on open when the table does not exist.
    pub fn auto_create_object(&mut self, statement: impl Into<String>) {
        self.auto_objects.push(statement.into());
    }

    /// Queue the table definition statement.
    pub fn ensure_schema(&mut self, statement: impl Into<String>) {
        self.auto_create_object(statement);
    }

    /// Queue a `CREATE [UNIQUE] INDEX IF NOT EXISTS` over `(column, ascending)` keys.
    pub fn ensure_index(
        &mut self,
        name: &str,
        keys: &[(&str, bool)],
        unique: bool,
        index_type: Option<&str>,
    ) -> Result<()> {
        let mut statement = String::from("CREATE");
        if unique {
            statement.push_str(" UNIQUE");
        }
        statement.push_str(" INDEX IF NOT EXISTS ");
        statement.push_str(&quote_identifier(name));
        statement.push_str(" ON ");
        statement.push_str(&self.quoted_table()?);
        if let Some(index_type) = index_type.filter(|t| !t.is_empty()) {
            statement.push_str(" USING ");
            statement.push_str(index_type);
        }

        let fields = keys
            .iter()
            .map(|(column, ascending)| {
                let column = quote_identifier(column);
                if *ascending {
                    column
                } else {
                    format!("{column} DESC")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        statement.push_str(&format!(" ({fields})"));

        self.auto_create_object(statement);
        Ok(())
    }

    /// Statements queued for auto-provisioning, in registration order.
    pub fn auto_objects(&self) -> &[String] {
        &self.auto_objects
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LifecycleState::Open
    }

    /// Open the persistence. A no-op when it is already open.
    pub async fn open(&self, trace_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Open => return Ok(()),
                LifecycleState::Closed => *state = LifecycleState::Opening,
                LifecycleState::Opening | LifecycleState::Closing => {
                    return Err(PersistenceError::invalid_state(
                        "BUSY",
                        format!("persistence is {:?}", *state),
                    ))
                }
            }
        }

        match self.open_connection(trace_id).await {
            Ok(manager) => {
                let database = manager.database_name().unwrap_or_default();
                *self.client.write() = Some(manager);
                *self.state.lock() = LifecycleState::Open;
                debug!(
                    trace_id,
                    database = %database,
                    table = self.table.as_deref().unwrap_or_default(),
                    "connected to postgres database"
                );
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = LifecycleState::Closed;
                Err(e)
            }
        }
    }

    async fn open_connection(&self, trace_id: &str) -> Result<Arc<dyn ConnectionManager>> {
        let bound = self.connection.as_ref().ok_or_else(|| {
            PersistenceError::invalid_state("NO_CONNECTION", "postgres connection is missing")
        })?;

        if bound.local {
            let descriptor = self.resolver.resolve(trace_id).await?;
            bound.manager.open(trace_id, &descriptor).await.map_err(|e| {
                PersistenceError::connection(
                    "CONNECT_FAILED",
                    "failed to open postgres connection",
                    Some(e),
                )
            })?;
        }

        if !bound.manager.is_open() {
            return Err(PersistenceError::connection(
                "CONNECT_FAILED",
                "postgres connection is not opened",
                None,
            ));
        }

        self.auto_create_objects(trace_id, bound.manager.as_ref())
            .await?;
        Ok(bound.manager.clone())
    }

    async fn auto_create_objects(&self, trace_id: &str, manager: &dyn ConnectionManager) -> Result<()> {
        if self.auto_objects.is_empty() {
            return Ok(());
        }

        let table = self.table()?;
        let probe = format!(
            "SELECT to_regclass({})",
            quote_literal(&quote_identifier(table))
        );
        let rows = manager.execute(&probe, &[]).await.map_err(|e| {
            PersistenceError::connection("CONNECT_FAILED", "connection to postgres failed", Some(e))
        })?;

        let exists = rows
            .first()
            .and_then(|row| row.get("to_regclass"))
            .is_some_and(|value| !value.is_null());
        if exists {
            return Ok(());
        }

        debug!(trace_id, table, "table does not exist, creating database objects");
        for statement in &self.auto_objects {
            if let Err(e) = manager.execute(statement, &[]).await {
                error!(trace_id, table, statement = %statement, error = %e, "failed to autocreate database object");
            }
        }
        Ok(())
    }

    /// Close the persistence. A no-op when it is not open.
    pub async fn close(&self, trace_id: &str) -> Result<()> {
        let bound = {
            let mut state = self.state.lock();
            if *state != LifecycleState::Open {
                return Ok(());
            }
            let bound = self.connection.as_ref().ok_or_else(|| {
                PersistenceError::invalid_state("NO_CONNECTION", "postgres connection is missing")
            })?;
            *state = LifecycleState::Closing;
            bound
        };

        let result = if bound.local {
            bound.manager.close(trace_id).await.map_err(|e| {
                PersistenceError::connection(
                    "CLOSE_FAILED",
                    "failed to close postgres connection",
                    Some(e),
                )
            })
        } else {
            Ok(())
        };

        *self.client.write() = None;
        *self.state.lock() = LifecycleState::Closed;
        debug!(trace_id, "disconnected from postgres database");
        result
    }

    fn client(&self) -> Result<Arc<dyn ConnectionManager>> {
        self.client.read().clone().ok_or_else(|| {
            PersistenceError::invalid_state("NOT_OPENED", "persistence is not opened")
        })
    }

    /// Run a statement on the open connection.
    pub async fn execute(&self, trace_id: &str, query: &str, params: &[Value]) -> Result<Vec<Row>> {
        let client = self.client()?;
        client.execute(query, params).await.map_err(|e| {
            trace!(trace_id, query, error = %e, "query failed");
            PersistenceError::query(format!("failed to execute: {query}"), e)
        })
    }

    pub(crate) fn to_public_all(&self, rows: Vec<Row>) -> Result<Vec<T>> {
        rows.into_iter().map(|row| self.mapper.to_public(row)).collect()
    }

    pub(crate) fn to_public_first(&self, rows: Vec<Row>) -> Result<Option<T>> {
        rows.into_iter()
            .next()
            .map(|row| self.mapper.to_public(row))
            .transpose()
    }

    /// Delete every row of the table.
    pub async fn clear(&self, trace_id: &str) -> Result<()> {
        let query = format!("DELETE FROM {}", self.quoted_table()?);
        self.execute(trace_id, &query, &[]).await?;
        trace!(trace_id, table = self.table.as_deref(), "cleared table");
        Ok(())
    }

    fn select_query(&self, filter: Option<&str>, sort: Option<&str>, projection: Option<&str>) -> Result<String> {
        let projection = non_empty(projection).unwrap_or("*");
        let mut query = format!("SELECT {projection} FROM {}", self.quoted_table()?);
        if let Some(filter) = non_empty(filter) {
            query.push_str(" WHERE ");
            query.push_str(filter);
        }
        if let Some(sort) = non_empty(sort) {
            query.push_str(" ORDER BY ");
            query.push_str(sort);
        }
        Ok(query)
    }

    /// Get one page of records matching a filter.
    pub async fn get_page_by_filter(
        &self,
        trace_id: &str,
        filter: Option<&str>,
        paging: Option<PagingParams>,
        sort: Option<&str>,
        projection: Option<&str>,
    ) -> Result<DataPage<T>> {
        let paging = paging.unwrap_or_default();
        let max_take = i64::try_from(self.max_page_size).unwrap_or(i64::MAX);

        let mut query = self.select_query(filter, sort, projection)?;
        if let Some(skip) = paging.skip() {
            query.push_str(&format!(" OFFSET {skip}"));
        }
        query.push_str(&format!(" LIMIT {}", paging.take(max_take)));

        let rows = self.execute(trace_id, &query, &[]).await?;
        trace!(trace_id, table = self.table.as_deref(), count = rows.len(), "retrieved items");
        let items = self.to_public_all(rows)?;

        let total = if paging.total {
            Some(self.get_count_by_filter(trace_id, filter).await?)
        } else {
            None
        };
        Ok(DataPage::new(items, total))
    }

    /// Count records matching a filter.
    pub async fn get_count_by_filter(&self, trace_id: &str, filter: Option<&str>) -> Result<i64> {
        let mut query = format!("SELECT COUNT(*) AS count FROM {}", self.quoted_table()?);
        if let Some(filter) = non_empty(filter) {
            query.push_str(" WHERE ");
            query.push_str(filter);
        }

        let rows = self.execute(trace_id, &query, &[]).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("count"))
            .map(count_value)
            .unwrap_or(0);
        trace!(trace_id, table = self.table.as_deref(), count, "counted items");
        Ok(count)
    }

    /// Get every record matching a filter.
    pub async fn get_list_by_filter(
        &self,
        trace_id: &str,
        filter: Option<&str>,
        sort: Option<&str>,
        projection: Option<&str>,
    ) -> Result<Vec<T>> {
        let query = self.select_query(filter, sort, projection)?;
        let rows = self.execute(trace_id, &query, &[]).await?;
        trace!(trace_id, table = self.table.as_deref(), count = rows.len(), "retrieved items");
        self.to_public_all(rows)
    }

    /// Get a random record matching a filter.
    ///
    /// The count and the fetch are separate statements, so concurrent writers
    /// can make the picked offset miss; the result is then `None`.
    pub async fn get_one_random(&self, trace_id: &str, filter: Option<&str>) -> Result<Option<T>> {
        let count = self.get_count_by_filter(trace_id, filter).await?;
        if count <= 0 {
            trace!(trace_id, table = self.table.as_deref(), "random item wasn't found");
            return Ok(None);
        }

        let pos = self.rng.lock().gen_range(0..count);
        let mut query = self.select_query(filter, None, None)?;
        query.push_str(&format!(" OFFSET {pos} LIMIT 1"));

        let rows = self.execute(trace_id, &query, &[]).await?;
        let item = self.to_public_first(rows)?;
        if item.is_some() {
            trace!(trace_id, table = self.table.as_deref(), pos, "retrieved random item");
        } else {
            trace!(trace_id, table = self.table.as_deref(), "random item wasn't found");
        }
        Ok(item)
    }

    /// Insert a record and return the row the database stored.
    pub async fn create(&self, trace_id: &str, record: &T) -> Result<T> {
        let row = self.mapper.from_public(record)?;
        let table = self.quoted_table()?;

        let (query, values) = if row.is_empty() {
            (format!("INSERT INTO {table} DEFAULT VALUES RETURNING *"), Vec::new())
        } else {
            let fragments = InsertFragments::from_row(&row)?;
            (
                format!(
                    "INSERT INTO {table} ({}) VALUES ({}) RETURNING *",
                    fragments.columns, fragments.placeholders
                ),
                fragments.values,
            )
        };

        let rows = self.execute(trace_id, &query, &values).await?;
        let created = self.to_public_first(rows)?.ok_or_else(|| {
            PersistenceError::query(
                format!("failed to execute: {query}"),
                anyhow::anyhow!("insert returned no rows"),
            )
        })?;
        trace!(trace_id, table = self.table.as_deref(), id = ?row.get("id"), "created item");
        Ok(created)
    }

    /// Delete every record matching a filter.
    pub async fn delete_by_filter(&self, trace_id: &str, filter: Option<&str>) -> Result<()> {
        let mut query = format!("DELETE FROM {}", self.quoted_table()?);
        if let Some(filter) = non_empty(filter) {
            query.push_str(" WHERE ");
            query.push_str(filter);
        }
        self.execute(trace_id, &query, &[]).await?;
        trace!(trace_id, table = self.table.as_deref(), "deleted items by filter");
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// `COUNT(*)` comes back as a number or, from some drivers, as text.
fn count_value(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}
