use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::database::{NewTodo, TodoValidationError};
use crate::error::ApiError;
use crate::handlers::extract::JsonOrForm;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct AddTodoRequest {
    #[serde(rename = "todoText", default)]
    pub todo_text: Option<Value>,
}

/// GET /api/todos - newest first
pub async fn list_todos(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let todos = state.todos.list().await.map_err(|e| {
        ApiError::internal("failed to fetch todos", "Failed to fetch todos due to a server error.", &e)
    })?;
    Ok(Json(todos))
}

/// POST /add-todo
pub async fn add_todo(
    State(state): State<AppState>,
    JsonOrForm(request): JsonOrForm<AddTodoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let raw = match request.todo_text {
        Some(Value::String(text)) => text,
        _ => return Err(TodoValidationError::Empty.into()),
    };
    let todo = NewTodo::parse(&raw)?;

    let record = state.todos.create(todo).await.map_err(|e| {
        ApiError::internal("failed to save todo", "Failed to save todo due to a server error.", &e)
    })?;
    info!(todo_id = record.id, "todo added");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Todo added successfully!", "todo": record })),
    ))
}
