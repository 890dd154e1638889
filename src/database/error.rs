use std::time::Duration;
use thiserror::Error;

use crate::iam::SigningError;

/// Failure to open a physical connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to obtain IAM auth token")]
    Credential(#[source] SigningError),

    #[error("database handshake failed: {0}")]
    Handshake(String),

    #[error("database connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure to check a connection out of the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a free database connection")]
    Exhausted(Duration),

    #[error("database pool is closed")]
    Closed,

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The statement failed; the connection itself is still usable.
    #[error("query failed: {0}")]
    Statement(String),

    /// The link to the database broke while the query ran.
    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    /// Whether the connection that produced this error must be discarded.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, QueryError::Connection(_) | QueryError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to close {failed} of {total} database connections: {last}")]
    Close {
        failed: usize,
        total: usize,
        last: String,
    },
}

/// Pool-level failure reported to whoever supervises the process.
#[derive(Debug, Clone, Error)]
pub enum PoolFault {
    #[error("unexpected error on idle database connection {connection_id}: {reason}")]
    IdleConnection { connection_id: u64, reason: String },
}
