//! Connection manager contract and the descriptor it is opened with.

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use url::Url;

use crate::data::Row;

/// Owner of the physical connection pool.
///
/// The engine only ever talks to the database through this trait. Errors are
/// opaque driver errors; the engine wraps them into typed persistence errors.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Open the pool with a resolved descriptor. Only called for managers the
    /// persistence owns.
    async fn open(&self, trace_id: &str, descriptor: &ConnectionDescriptor) -> anyhow::Result<()>;

    async fn close(&self, trace_id: &str) -> anyhow::Result<()>;

    fn is_open(&self) -> bool;

    /// Execute one statement with positional `$n` parameters and return the
    /// rows it produced (empty for statements without a result set).
    async fn execute(&self, query: &str, params: &[Value]) -> anyhow::Result<Vec<Row>>;

    /// Database name for diagnostics.
    fn database_name(&self) -> Option<String> {
        None
    }
}

/// Validated, merged connection parameters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    /// The last uri seen while merging, if any.
    pub uri: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub max_pool_size: Option<u32>,
}

impl ConnectionDescriptor {
    /// Overlay the parts of a `postgres://` uri onto this descriptor.
    pub fn apply_uri(&mut self, uri: &str) -> Result<(), url::ParseError> {
        let parsed = Url::parse(uri)?;

        if let Some(host) = parsed.host_str().filter(|h| !h.is_empty()) {
            self.host = Some(host.to_string());
        }
        if let Some(port) = parsed.port() {
            self.port = Some(port);
        }
        let database = parsed.path().trim_start_matches('/');
        if !database.is_empty() {
            self.database = Some(decode(database));
        }
        if !parsed.username().is_empty() {
            self.username = Some(decode(parsed.username()));
        }
        if let Some(password) = parsed.password() {
            self.password = Some(decode(password));
        }

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "connect_timeout" => self.connect_timeout = value.parse().ok(),
                "idle_timeout" => self.idle_timeout = value.parse().ok(),
                "max_pool_size" => self.max_pool_size = value.parse().ok(),
                _ => {}
            }
        }

        self.uri = Some(uri.to_string());
        Ok(())
    }

    /// Render the descriptor as a `postgres://` connection string.
    pub fn uri(&self) -> String {
        let host = self.host.as_deref().unwrap_or("localhost");
        let mut rendered = match Url::parse(&format!("postgres://{host}")) {
            Ok(url) => url,
            Err(_) => return self.uri.clone().unwrap_or_default(),
        };

        // Setters only fail for cannot-be-a-base urls, which postgres:// never is.
        let _ = rendered.set_port(self.port);
        if let Some(username) = &self.username {
            let _ = rendered.set_username(username);
        }
        if let Some(password) = &self.password {
            let _ = rendered.set_password(Some(password));
        }
        if let Some(database) = &self.database {
            rendered.set_path(database);
        }

        {
            let mut query = rendered.query_pairs_mut();
            if let Some(timeout) = self.connect_timeout {
                query.append_pair("connect_timeout", &timeout.to_string());
            }
            if let Some(timeout) = self.idle_timeout {
                query.append_pair("idle_timeout", &timeout.to_string());
            }
            if let Some(size) = self.max_pool_size {
                query.append_pair("max_pool_size", &size.to_string());
            }
        }
        if rendered.query() == Some("") {
            rendered.set_query(None);
        }

        rendered.to_string()
    }
}

fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}
