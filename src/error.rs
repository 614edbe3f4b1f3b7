/// Errors surfaced by the persistence engine and the connection resolver.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Missing or invalid configuration (table name, host, port, database).
    #[error("config error [{code}]: {message}")]
    Config { code: &'static str, message: String },

    /// Operation attempted without a bound or opened connection.
    #[error("invalid state [{code}]: {message}")]
    InvalidState { code: &'static str, message: String },

    /// The connection manager could not be opened or provisioned.
    #[error("connection error [{code}]: {message}")]
    Connection {
        code: &'static str,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// A record does not have the keyed shape SQL generation needs.
    #[error("shape error: {0}")]
    Shape(String),

    /// The driver failed to execute a statement.
    #[error("query error: {message}")]
    Query {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PersistenceError {
    pub fn config(code: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_state(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidState {
            code,
            message: message.into(),
        }
    }

    pub fn connection(
        code: &'static str,
        message: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::Connection {
            code,
            message: message.into(),
            source,
        }
    }

    pub fn query(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Query {
            message: message.into(),
            source,
        }
    }

    /// Machine-readable code for config, state and connection errors.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Config { code, .. }
            | Self::InvalidState { code, .. }
            | Self::Connection { code, .. } => Some(*code),
            Self::Shape(_) | Self::Query { .. } => None,
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Shape(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
