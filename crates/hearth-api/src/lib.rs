//! HTTP host for Hearth.
//!
//! This crate provides the host configuration, token authentication, the
//! extension admin API and the server that mounts extension routes.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod models;
pub mod server;
pub mod shutdown;

pub use auth::{token_digest, AdminUser, TokenAuthService};
pub use config::{ConfigError, HostConfig, CONFIG_ENV};
pub use models::{ApiError, ApiResponse, HandlerResult};
pub use server::{create_router, run, ApiState, Host};
pub use shutdown::shutdown_signal;
