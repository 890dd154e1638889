use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    Form,
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::middleware::current_session;
use crate::server::AppState;

const LOGIN_FAILED_PAGE: &str = r#"Login Failed. <a href="/login">Try again</a>
<script>
    setTimeout(() => { window.location.href = '/login'; }, 2000);
</script>"#;

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub password: String,
}

/// GET /login - the login page, or straight home when already signed in.
pub async fn login_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if current_session(&state.sessions, &headers).is_some() {
        return Redirect::to("/").into_response();
    }

    let path = state.static_dir.join("login.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read login page");
            ApiError::internal_server_error("Login page unavailable").into_response()
        }
    }
}

/// POST /login
pub async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    if !state.sessions.verify_password(&form.password) {
        warn!("failed login attempt");
        return (StatusCode::UNAUTHORIZED, Html(LOGIN_FAILED_PAGE)).into_response();
    }

    match state.sessions.issue() {
        Ok(token) => {
            info!("login successful, session established");
            (
                [(SET_COOKIE, state.sessions.session_cookie(&token))],
                Redirect::to("/"),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to establish session");
            (StatusCode::INTERNAL_SERVER_ERROR, "Login failed due to server error.").into_response()
        }
    }
}

/// GET /logout - revokes the presented session, then clears the cookie.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(claims) = current_session(&state.sessions, &headers) {
        state.sessions.revoke(&claims);
    }
    info!("session cleared");
    (
        [(SET_COOKIE, state.sessions.clear_cookie())],
        Redirect::to("/login"),
    )
        .into_response()
}
