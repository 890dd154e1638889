use thiserror::Error;
use tracing::{error, info};

use super::connector::Connector;
use super::error::{PoolError, QueryError};
use super::pool::ConnectionPool;

pub const CREATE_TODOS_TABLE: &str = "CREATE TABLE IF NOT EXISTS todos (
    id SERIAL PRIMARY KEY,
    text VARCHAR(255) NOT NULL,
    created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
)";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("could not get a connection to initialize the schema")]
    Connect(#[from] PoolError),

    #[error("failed to create todos table")]
    Statement(#[source] QueryError),
}

/// Create the `todos` table if it does not exist. Safe to run repeatedly.
pub async fn ensure_schema<C: Connector>(pool: &ConnectionPool<C>) -> Result<(), SchemaError> {
    let mut conn = pool.acquire().await?;
    let result = conn.query(CREATE_TODOS_TABLE, &[]).await;
    pool.release(conn).await;

    match result {
        Ok(_) => {
            info!("todos table is ready");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "failed to initialize database schema");
            Err(SchemaError::Statement(e))
        }
    }
}
