pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod iam;
pub mod middleware;
pub mod server;
pub mod shutdown;

#[cfg(test)]
pub mod testing;
