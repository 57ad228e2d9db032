use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use tracing::{debug, warn};
use uuid::Uuid;

use hush_types::api::{Claims, MessageResponse, SendMessageRequest};
use hush_types::events::GatewayEvent;

use crate::auth::AppState;
use crate::conversations::{conversation_for, corrupt};
use crate::run_blocking;

/// Store an encrypted message and push it to subscribed gateway connections.
/// The server never sees plaintext; ciphertext and IV are stored as given.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.sender_id != claims.sub {
        return Err(StatusCode::FORBIDDEN);
    }

    let ciphertext = B64.decode(&req.ciphertext).map_err(|_| StatusCode::BAD_REQUEST)?;
    let iv = B64.decode(&req.iv).map_err(|_| StatusCode::BAD_REQUEST)?;

    conversation_for(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let message_id = Uuid::new_v4();
    let sender_id = claims.sub;
    let row = run_blocking(move || {
        db.insert_message(
            &message_id.to_string(),
            &conversation_id.to_string(),
            &sender_id.to_string(),
            &ciphertext,
            &iv,
            chrono::Utc::now(),
        )
    })
    .await?;

    let message = row.into_message().map_err(corrupt)?;
    let response = MessageResponse::from(&message);
    debug!("Stored message {} in {}", message.id, conversation_id);

    state.dispatcher.broadcast(GatewayEvent::MessageCreate {
        message: response.clone(),
    });

    Ok((StatusCode::CREATED, Json(response)))
}

/// Full history of a conversation, oldest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessageResponse>>, StatusCode> {
    conversation_for(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let rows = run_blocking(move || db.get_messages(&conversation_id.to_string())).await?;

    let messages = rows
        .into_iter()
        .filter_map(|row| {
            let id = row.id.clone();
            match row.into_message() {
                Ok(message) => Some(MessageResponse::from(&message)),
                Err(e) => {
                    warn!("Skipping corrupt message row '{}': {:#}", id, e);
                    None
                }
            }
        })
        .collect();

    Ok(Json(messages))
}
