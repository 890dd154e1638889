use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{ConnectOptions, Connection, Postgres};

use super::connector::{Connector, SqlParam};
use super::error::{ConnectError, QueryError};
use crate::config::{DatabaseEndpointConfig, TrustBundle};
use crate::iam::AuthToken;

const APPLICATION_NAME: &str = "iam-todo";

/// Opens TLS-verified Postgres connections authenticated with IAM tokens.
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    /// Certificate and hostname verification are always on.
    pub fn new(endpoint: &DatabaseEndpointConfig, trust: &TrustBundle) -> Self {
        let options = PgConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&endpoint.user)
            .database(&endpoint.database)
            .ssl_mode(PgSslMode::VerifyFull)
            .ssl_root_cert_from_pem(trust.pem().to_vec())
            .application_name(APPLICATION_NAME);
        Self::from_options(options)
    }

    pub fn from_options(options: PgConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;
    type Row = PgRow;

    async fn connect(&self, password: AuthToken) -> Result<PgConnection, ConnectError> {
        self.options
            .clone()
            .password(password.expose())
            .connect()
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))
    }

    async fn query(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<PgRow>, QueryError> {
        let query = params.iter().fold(sqlx::query(sql), bind);
        query.fetch_all(&mut *conn).await.map_err(classify)
    }

    async fn ping(&self, conn: &mut PgConnection) -> Result<(), QueryError> {
        conn.ping().await.map_err(classify)
    }

    async fn close(&self, conn: PgConnection) -> Result<(), QueryError> {
        conn.close().await.map_err(classify)
    }
}

fn bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &SqlParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        SqlParam::Text(value) => query.bind(value.clone()),
        SqlParam::Int(value) => query.bind(*value),
        SqlParam::Bool(value) => query.bind(*value),
        SqlParam::Null => query.bind(None::<String>),
    }
}

/// Split driver errors into "statement failed" and "connection is gone".
fn classify(err: sqlx::Error) -> QueryError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => QueryError::Connection(err.to_string()),
        _ => QueryError::Statement(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_and_protocol_errors_are_connection_errors() {
        let io_err = sqlx::Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(classify(io_err).is_connection_error());
        assert!(classify(sqlx::Error::Protocol("unexpected message".into())).is_connection_error());
    }

    #[test]
    fn row_and_decode_errors_are_statement_errors() {
        assert!(matches!(classify(sqlx::Error::RowNotFound), QueryError::Statement(_)));
        assert!(matches!(
            classify(sqlx::Error::ColumnNotFound("text".into())),
            QueryError::Statement(_)
        ));
    }
}
