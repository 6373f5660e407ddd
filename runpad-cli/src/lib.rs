//! Runpad application layer: configuration, logging, the HTTP service and
//! the local command implementations behind the `runpad` binary.

pub mod commands;
pub mod config;
pub mod logging;
pub mod server;

pub use config::{AppConfig, LoggingConfig, ServerConfig};
pub use server::{create_router, start_server, AppState};
