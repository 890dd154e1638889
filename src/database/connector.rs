use async_trait::async_trait;

use super::error::{ConnectError, QueryError};
use crate::iam::AuthToken;

/// A bind parameter for [`Connector::query`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

/// Opens and drives physical connections for the pool.
///
/// `connect` receives the password by value: each token authenticates exactly
/// one handshake.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Row: Send + 'static;

    async fn connect(&self, password: AuthToken) -> Result<Self::Connection, ConnectError>;

    async fn query(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Self::Row>, QueryError>;

    /// Cheap liveness round-trip used on idle connections.
    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), QueryError>;

    async fn close(&self, conn: Self::Connection) -> Result<(), QueryError>;
}
