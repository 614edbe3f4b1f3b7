//! Persistence configuration.
//!
//! Mirrors the recognized option groups: the table name (`table` or
//! `collection`), `options.*`, `connection`/`connections` and `credential`.
//! Everything deserializes with serde so the same struct can be loaded from
//! JSON or built in code with the `with_*` methods.

use serde::{Deserialize, Serialize};

use crate::error::{PersistenceError, Result};

pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;

/// One connection entry. Either `uri` or `host`/`port`/`database` are
/// expected; `discovery_key` defers the entry to a discovery service.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub discovery_key: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub uri: Option<String>,
}

impl ConnectionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_discovery_key(mut self, key: impl Into<String>) -> Self {
        self.discovery_key = Some(key.into());
        self
    }

    /// Non-empty uri, if any.
    pub fn uri(&self) -> Option<&str> {
        non_empty(&self.uri)
    }

    pub fn host(&self) -> Option<&str> {
        non_empty(&self.host)
    }

    /// Port, with 0 treated as unset.
    pub fn port(&self) -> Option<u16> {
        self.port.filter(|p| *p != 0)
    }

    pub fn database(&self) -> Option<&str> {
        non_empty(&self.database)
    }

    pub fn discovery_key(&self) -> Option<&str> {
        non_empty(&self.discovery_key)
    }
}

/// Credentials, either inline or deferred to a credential store via `store_key`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialParams {
    pub store_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CredentialParams {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            store_key: None,
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub fn from_store_key(key: impl Into<String>) -> Self {
        Self {
            store_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn username(&self) -> Option<&str> {
        non_empty(&self.username)
    }

    pub fn password(&self) -> Option<&str> {
        non_empty(&self.password)
    }

    pub fn store_key(&self) -> Option<&str> {
        non_empty(&self.store_key)
    }

    pub fn is_empty(&self) -> bool {
        self.store_key().is_none() && self.username().is_none() && self.password().is_none()
    }
}

/// The `options.*` group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceOptions {
    pub max_page_size: usize,
    /// Milliseconds to wait for a new connection.
    pub connect_timeout: Option<u64>,
    /// Milliseconds a pooled connection may stay idle.
    pub idle_timeout: Option<u64>,
    pub max_pool_size: Option<u32>,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            connect_timeout: None,
            idle_timeout: None,
            max_pool_size: None,
        }
    }
}

/// Full configuration of one persistence component.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub table: Option<String>,
    pub collection: Option<String>,
    pub options: PersistenceOptions,
    pub connection: Option<ConnectionParams>,
    pub connections: Vec<ConnectionParams>,
    pub credential: Option<CredentialParams>,
}

impl PersistenceConfig {
    /// Create a config for the given table with default options.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Self::default()
        }
    }

    /// Parse a JSON document with the recognized option groups.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PersistenceError::config("BAD_CONFIG", format!("invalid config: {e}")))
    }

    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.options.max_page_size = max_page_size;
        self
    }

    pub fn with_connect_timeout(mut self, millis: u64) -> Self {
        self.options.connect_timeout = Some(millis);
        self
    }

    pub fn with_idle_timeout(mut self, millis: u64) -> Self {
        self.options.idle_timeout = Some(millis);
        self
    }

    pub fn with_max_pool_size(mut self, size: u32) -> Self {
        self.options.max_pool_size = Some(size);
        self
    }

    /// Append a connection entry. Later entries override earlier ones.
    pub fn with_connection(mut self, connection: ConnectionParams) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn with_credential(mut self, credential: CredentialParams) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Table name; `table` takes precedence over `collection`.
    pub fn table_name(&self) -> Option<&str> {
        non_empty(&self.table).or_else(|| non_empty(&self.collection))
    }

    /// The single `connection` entry followed by the `connections` list.
    pub fn all_connections(&self) -> Vec<ConnectionParams> {
        self.connection
            .iter()
            .chain(self.connections.iter())
            .cloned()
            .collect()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_option_groups() {
        let config = PersistenceConfig::from_json(
            r#"{
                "collection": "dummies",
                "options": { "max_page_size": 25, "connect_timeout": 5000 },
                "connection": { "host": "localhost", "port": 5432, "database": "test" },
                "credential": { "username": "user", "password": "secret" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.table_name(), Some("dummies"));
        assert_eq!(config.options.max_page_size, 25);
        assert_eq!(config.options.connect_timeout, Some(5000));
        let connections = config.all_connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].host(), Some("localhost"));
        assert_eq!(connections[0].port(), Some(5432));
        assert_eq!(config.credential.unwrap().username(), Some("user"));
    }

    #[test]
    fn table_wins_over_collection() {
        let config = PersistenceConfig::from_json(r#"{"collection": "a", "table": "b"}"#).unwrap();
        assert_eq!(config.table_name(), Some("b"));
    }

    #[test]
    fn empty_values_are_unset() {
        let config = PersistenceConfig::from_json(r#"{"table": ""}"#).unwrap();
        assert_eq!(config.table_name(), None);
        assert_eq!(config.options.max_page_size, DEFAULT_MAX_PAGE_SIZE);

        let params = ConnectionParams::new().with_host("").with_port(0);
        assert_eq!(params.host(), None);
        assert_eq!(params.port(), None);
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let err = PersistenceConfig::from_json("{").unwrap_err();
        assert_eq!(err.code(), Some("BAD_CONFIG"));
    }
}
