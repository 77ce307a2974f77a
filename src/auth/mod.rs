pub mod config;
pub mod jwt;
pub mod service;

pub use config::{KeysConfig, TelegramConfig};
pub use jwt::{IssuedToken, TOKEN_TYPE, TokenClaims, TokenService};
pub use service::{LoginResponse, LoginService, UserSummary};
