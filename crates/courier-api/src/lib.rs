//! Courier HTTP management API.
//!
//! Webhook CRUD, security settings, delivery history, event ingestion and
//! health probes over axum, plus the service configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{create_router, shutdown_signal, start_server};
pub use state::AppState;
