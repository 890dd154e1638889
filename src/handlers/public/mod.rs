pub mod auth;
pub mod health;

pub use auth::{login, login_page, logout};
pub use health::health;
