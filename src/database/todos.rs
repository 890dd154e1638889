use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;

use super::connector::SqlParam;
use super::error::QueryError;
use super::pool::ConnectionPool;
use super::postgres::PgConnector;

pub const MAX_TODO_LEN: usize = 255;

const LIST_TODOS: &str = "SELECT id, text, created_at FROM todos ORDER BY created_at DESC";
const INSERT_TODO: &str = "INSERT INTO todos (text) VALUES ($1) RETURNING id, text, created_at";

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct TodoRecord {
    pub id: i32,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TodoValidationError {
    #[error("Todo text cannot be empty.")]
    Empty,

    #[error("Todo text cannot be longer than {max} characters.")]
    TooLong { max: usize },
}

/// Validated todo text, trimmed of surrounding whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTodo(String);

impl NewTodo {
    pub fn parse(raw: &str) -> Result<Self, TodoValidationError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(TodoValidationError::Empty);
        }
        if text.chars().count() > MAX_TODO_LEN {
            return Err(TodoValidationError::TooLong { max: MAX_TODO_LEN });
        }
        Ok(Self(text.to_string()))
    }

    pub fn text(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum TodoStoreError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("failed to decode todo row: {0}")]
    Decode(String),
}

#[async_trait]
pub trait TodoStore: Send + Sync {
    /// Newest first.
    async fn list(&self) -> Result<Vec<TodoRecord>, TodoStoreError>;

    async fn create(&self, todo: NewTodo) -> Result<TodoRecord, TodoStoreError>;
}

pub struct TodoRepository {
    pool: ConnectionPool<PgConnector>,
}

impl TodoRepository {
    pub fn new(pool: ConnectionPool<PgConnector>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TodoStore for TodoRepository {
    async fn list(&self) -> Result<Vec<TodoRecord>, TodoStoreError> {
        let rows = self.pool.query(LIST_TODOS, &[]).await?;
        rows.iter()
            .map(|row| TodoRecord::from_row(row).map_err(|e| TodoStoreError::Decode(e.to_string())))
            .collect()
    }

    async fn create(&self, todo: NewTodo) -> Result<TodoRecord, TodoStoreError> {
        let rows = self.pool.query(INSERT_TODO, &[SqlParam::Text(todo.0)]).await?;
        let row = rows
            .first()
            .ok_or_else(|| TodoStoreError::Decode("insert returned no row".into()))?;
        TodoRecord::from_row(row).map_err(|e| TodoStoreError::Decode(e.to_string()))
    }
}
