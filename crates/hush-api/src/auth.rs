use std::sync::Arc;

use axum::{Extension, Json, response::IntoResponse};

use hush_db::Database;
use hush_gateway::dispatcher::Dispatcher;
use hush_types::api::Claims;
use hush_types::models::UserIdentity;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

/// The identity behind the bearer token.
pub async fn me(Extension(claims): Extension<Claims>) -> impl IntoResponse {
    Json(UserIdentity {
        id: claims.sub,
        username: claims.username,
    })
}
