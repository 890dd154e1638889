pub mod auth;

pub use auth::{current_session, require_session};
