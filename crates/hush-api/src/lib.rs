//! HTTP surface of the hush backend: conversations, encrypted messages and
//! the gateway upgrade. Handlers run blocking SQLite work off the async
//! runtime and map every failure to a bare status code.

pub mod auth;
pub mod conversations;
pub mod messages;
pub mod middleware;
pub mod routes;

use axum::http::StatusCode;
use tracing::error;

/// Run a blocking database closure on the blocking pool.
pub(crate) async fn run_blocking<F, T>(f: F) -> Result<T, StatusCode>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("Database error: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
