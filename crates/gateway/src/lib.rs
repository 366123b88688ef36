//! Management HTTP API for a running [`jobkit_cron::JobManager`].
//!
//! JSON endpoints for job status, history and control, plus a server-sent
//! event stream of invocation output. See [`server::build_app`] for routes.

pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics_middleware;
#[cfg(feature = "prometheus")]
pub mod metrics_routes;
pub mod routes;
pub mod server;
pub mod stream;

pub use {
    error::{ApiError, ApiResult},
    server::{AppState, build_app, serve, start_server},
};
