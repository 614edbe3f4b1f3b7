#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pg_persistence::{
    ConnectionDescriptor, ConnectionManager, Identifiable, IdentifiablePersistence,
    PersistenceConfig, Row, SqliteConnection,
};

pub const DUMMIES_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS \"dummies\" (\"id\" TEXT PRIMARY KEY, \"key\" TEXT, \"content\" TEXT)";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dummy {
    pub id: Option<String>,
    pub key: String,
    pub content: String,
}

impl Dummy {
    pub fn new(key: &str, content: &str) -> Self {
        Self {
            id: None,
            key: key.to_string(),
            content: content.to_string(),
        }
    }

    pub fn with_id(id: &str, key: &str, content: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            key: key.to_string(),
            content: content.to_string(),
        }
    }
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

/// Connection manager that records every statement it is asked to run.
///
/// With an inner manager the statements are forwarded to it; otherwise the
/// queued responses are returned in order, and an empty row set once the
/// queue runs dry.
pub struct RecordingConnection {
    inner: Option<Arc<dyn ConnectionManager>>,
    open: AtomicBool,
    statements: Mutex<Vec<(String, Vec<Value>)>>,
    responses: Mutex<VecDeque<anyhow::Result<Vec<Row>>>>,
    opened_with: Mutex<Vec<ConnectionDescriptor>>,
    closes: Mutex<usize>,
}

impl RecordingConnection {
    /// A scripted manager that starts out open.
    pub fn scripted() -> Self {
        Self {
            inner: None,
            open: AtomicBool::new(true),
            statements: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            opened_with: Mutex::new(Vec::new()),
            closes: Mutex::new(0),
        }
    }

    /// A scripted manager that starts out closed.
    pub fn closed() -> Self {
        let connection = Self::scripted();
        connection.open.store(false, Ordering::SeqCst);
        connection
    }

    /// Forward everything to `inner` while recording.
    pub fn wrapping(inner: Arc<dyn ConnectionManager>) -> Self {
        Self {
            inner: Some(inner),
            ..Self::scripted()
        }
    }

    pub fn respond(&self, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .map(|row| match row {
                Value::Object(map) => map,
                other => panic!("response rows must be objects, got {other}"),
            })
            .collect();
        self.responses.lock().push_back(Ok(rows));
    }

    pub fn fail(&self, message: &str) {
        self.responses.lock().push_back(Err(anyhow!(message.to_string())));
    }

    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.statements.lock().clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements.lock().iter().map(|(sql, _)| sql.clone()).collect()
    }

    pub fn last(&self) -> (String, Vec<Value>) {
        self.statements
            .lock()
            .last()
            .cloned()
            .expect("no statement was executed")
    }

    pub fn reset(&self) {
        self.statements.lock().clear();
    }

    pub fn opened_with(&self) -> Vec<ConnectionDescriptor> {
        self.opened_with.lock().clone()
    }

    pub fn closes(&self) -> usize {
        *self.closes.lock()
    }
}

#[async_trait]
impl ConnectionManager for RecordingConnection {
    async fn open(&self, trace_id: &str, descriptor: &ConnectionDescriptor) -> anyhow::Result<()> {
        self.opened_with.lock().push(descriptor.clone());
        if let Some(inner) = &self.inner {
            inner.open(trace_id, descriptor).await?;
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, trace_id: &str) -> anyhow::Result<()> {
        *self.closes.lock() += 1;
        if let Some(inner) = &self.inner {
            inner.close(trace_id).await?;
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.is_open(),
            None => self.open.load(Ordering::SeqCst),
        }
    }

    async fn execute(&self, query: &str, params: &[Value]) -> anyhow::Result<Vec<Row>> {
        self.statements
            .lock()
            .push((query.to_string(), params.to_vec()));
        if let Some(inner) = &self.inner {
            return inner.execute(query, params).await;
        }
        let response = self.responses.lock().pop_front();
        response.unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// An in-memory SQLite database, already opened.
pub fn sqlite() -> Arc<SqliteConnection> {
    Arc::new(SqliteConnection::in_memory().expect("failed to open in-memory sqlite"))
}

/// A dummies persistence over a fresh in-memory database, opened.
pub async fn create_test_persistence() -> IdentifiablePersistence<Dummy> {
    let mut persistence = IdentifiablePersistence::<Dummy>::new(&PersistenceConfig::new("dummies"))
        .with_connection(sqlite());
    persistence.base_mut().ensure_schema(DUMMIES_TABLE);
    persistence.open("123").await.expect("failed to open persistence");
    persistence
}

pub fn ids(items: &[Dummy]) -> Vec<String> {
    let mut ids: Vec<String> = items.iter().filter_map(|d| d.id.clone()).collect();
    ids.sort();
    ids
}
