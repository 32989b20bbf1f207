//! Error taxonomy shared by every stage of a Kafka output job.
//!
//! Each variant corresponds to one failure class. The class decides how far
//! the failure propagates:
//!
//! - [`KafkaOutputError::Configuration`] and [`KafkaOutputError::Connectivity`]
//!   abort the whole job before any row is processed.
//! - [`KafkaOutputError::Schema`], [`KafkaOutputError::Routing`] and
//!   [`KafkaOutputError::Send`] abort only the task that hit them. Messages that
//!   task already delivered stay published.
//! - [`KafkaOutputError::UnsupportedOperation`] is returned for requests the
//!   output never honours, such as resuming a failed job.

use std::fmt;

/// Result alias used across the tabkafka crates.
pub type Result<T, E = KafkaOutputError> = std::result::Result<T, E>;

/// Failure raised while configuring, opening or running a Kafka output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KafkaOutputError {
    /// Bad or contradictory options, detected before the job starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Brokers or registry unreachable, or the destination topic missing.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Unparsable target schema, or a column that does not fit it.
    #[error("schema error: {0}")]
    Schema(String),

    /// Row could not be routed to a topic, key or partition.
    #[error("routing error: {0}")]
    Routing(String),

    /// The client gave up on a message after its internal retries.
    #[error("send error: {0}")]
    Send(String),

    /// Operation the output never supports.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Class of a [`KafkaOutputError`], without its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Schema,
    Routing,
    Send,
    UnsupportedOperation,
}

impl KafkaOutputError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::Schema(_) => ErrorKind::Schema,
            Self::Routing(_) => ErrorKind::Routing,
            Self::Send(_) => ErrorKind::Send,
            Self::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
        }
    }

    /// Whether the error stops the whole job rather than a single task.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::Connectivity | ErrorKind::UnsupportedOperation
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Connectivity => "ConnectivityError",
            ErrorKind::Schema => "SchemaError",
            ErrorKind::Routing => "RoutingError",
            ErrorKind::Send => "SendError",
            ErrorKind::UnsupportedOperation => "UnsupportedOperationError",
        };
        f.write_str(name)
    }
}

impl From<serde_yaml::Error> for KafkaOutputError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}
