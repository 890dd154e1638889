use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::auth::SessionManager;
use crate::database::{HealthCheck, TodoStore};
use crate::handlers::{protected, public};
use crate::middleware::require_session;

/// Everything the handlers need, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub todos: Arc<dyn TodoStore>,
    pub health: Arc<dyn HealthCheck>,
    pub sessions: Arc<SessionManager>,
    pub static_dir: PathBuf,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(protected_routes(state.clone()))
        .merge(public_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/login", get(public::login_page).post(public::login))
        .route("/logout", get(public::logout))
        .route("/health", get(public::health))
}

/// Todo API plus the static front end, all behind the session check.
fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/todos", get(protected::list_todos))
        .route("/add-todo", post(protected::add_todo))
        .fallback_service(ServeDir::new(&state.static_dir))
        .layer(from_fn_with_state(state, require_session))
}
