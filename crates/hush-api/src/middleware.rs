use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};

use hush_gateway::auth::verify_token;

use crate::auth::AppState;
use crate::run_blocking;

/// Extract and validate JWT from Authorization header.
/// The token's display name is recorded so partners can be listed by name.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let claims = {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        verify_token(&state.jwt_secret, token).ok_or(StatusCode::UNAUTHORIZED)?
    };

    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let username = claims.username.clone();
    run_blocking(move || db.upsert_user(&user_id, &username)).await?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
