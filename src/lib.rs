pub mod auth;
pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod jobs;
pub mod keys;
pub mod metrics;
pub mod rate_limit;
pub mod revocation;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod telegram;
pub mod utils;
pub mod verifier;

#[cfg(test)]
pub mod test_utils;

pub use config::Config;
pub use server::Server;
