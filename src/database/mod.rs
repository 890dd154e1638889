pub mod connector;
pub mod credential;
pub mod error;
pub mod health;
pub mod pool;
pub mod postgres;
pub mod schema;
pub mod todos;

pub use connector::{Connector, SqlParam};
pub use credential::CredentialProvider;
pub use error::{ConnectError, PoolError, PoolFault, QueryError, ShutdownError};
pub use health::{HealthCheck, HealthProbe, HealthStatus};
pub use pool::{ConnectionPool, IdleErrorPolicy, PoolConfig, PoolStats, PooledConnection};
pub use postgres::PgConnector;
pub use schema::{ensure_schema, SchemaError};
pub use todos::{NewTodo, TodoRecord, TodoRepository, TodoStore, TodoStoreError, TodoValidationError};
