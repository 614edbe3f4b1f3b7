//! Generic PostgreSQL table persistence.
//!
//! # Intention
//!
//! - Store records of any serde-compatible shape in a single table without
//!   per-type SQL.
//! - Generate column, placeholder, SET and value lists from one row snapshot
//!   so they always line up.
//! - Resolve connection and credential parameters into one validated
//!   descriptor.
//!
//! # Architectural Boundaries
//!
//! - The physical connection pool lives behind [`ConnectionManager`]; this
//!   crate only generates statements and decodes rows.
//! - Filters, sort expressions and projections are trusted SQL text.
//! - No query planning, relationships, migrations or transactions.

pub mod config;
pub mod connection;
pub mod data;
pub mod error;
pub mod identifiable;
pub mod json;
pub mod mapper;
pub mod persistence;
pub mod resolver;
pub mod sql;
pub mod sqlite;

pub use config::{ConnectionParams, CredentialParams, PersistenceConfig, PersistenceOptions};
pub use connection::{ConnectionDescriptor, ConnectionManager};
pub use data::{DataPage, PagingParams, Row};
pub use error::{PersistenceError, Result};
pub use identifiable::{IdentifiablePersistence, IdentifiableStore};
pub use json::IdentifiableJsonPersistence;
pub use mapper::{ColumnMapper, IdGenerator, Identifiable, JsonColumnMapper, RowMapper};
pub use persistence::{LifecycleState, Persistence};
pub use resolver::{
    ConnectionResolver, CredentialStore, Discovery, MemoryCredentialStore, MemoryDiscovery,
};
pub use sqlite::SqliteConnection;
