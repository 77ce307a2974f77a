pub mod admin;
pub mod auth;
pub mod health;
pub mod keys;

pub use admin::create_admin_routes;
pub use auth::create_auth_routes;
pub use health::create_health_routes;
pub use keys::create_key_routes;
