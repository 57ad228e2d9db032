use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use hush_db::CreateOutcome;
use hush_types::api::{Claims, ConversationLookup, CreateConversationRequest};
use hush_types::models::{Conversation, ConversationSummary};

use crate::auth::AppState;
use crate::run_blocking;

/// Create a conversation between two users. The caller must be one of them,
/// and the key blob is stored exactly once.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.participant_a == req.participant_b || req.key_blob.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if claims.sub != req.participant_a && claims.sub != req.participant_b {
        return Err(StatusCode::FORBIDDEN);
    }

    let partner = if claims.sub == req.participant_a {
        req.participant_b
    } else {
        req.participant_a
    };

    let db = state.db.clone();
    let partner_row = run_blocking(move || db.get_user_by_id(&partner.to_string())).await?;
    if partner_row.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let db = state.db.clone();
    let id = Uuid::new_v4();
    let outcome = run_blocking(move || {
        db.create_conversation(
            &id.to_string(),
            &req.participant_a.to_string(),
            &req.participant_b.to_string(),
            &req.key_blob,
            chrono::Utc::now(),
        )
    })
    .await?;

    match outcome {
        CreateOutcome::Created(row) => {
            let conversation = row.into_conversation().map_err(corrupt)?;
            info!("{} started conversation {} with {}", claims.username, conversation.id, partner);
            Ok((StatusCode::CREATED, Json(conversation)))
        }
        CreateOutcome::Exists(row) => {
            warn!("Conversation {} already exists for this pair", row.id);
            Err(StatusCode::CONFLICT)
        }
    }
}

/// Look up the conversation between two users, if any.
pub async fn find_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(lookup): Query<ConversationLookup>,
) -> Result<Json<Conversation>, StatusCode> {
    if claims.sub != lookup.a && claims.sub != lookup.b {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();
    let row = run_blocking(move || db.find_conversation(&lookup.a.to_string(), &lookup.b.to_string()))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(row.into_conversation().map_err(corrupt)?))
}

/// All conversations of the caller, newest first, with the partner's display identity.
pub async fn list_conversations(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ConversationSummary>>, StatusCode> {
    if user_id != claims.sub {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();
    let rows = run_blocking(move || db.list_conversations(&user_id.to_string())).await?;

    let summaries = rows
        .into_iter()
        .filter_map(|row| match row.into_summary() {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Skipping corrupt conversation row: {:#}", e);
                None
            }
        })
        .collect();

    Ok(Json(summaries))
}

/// Load a conversation and check that `user_id` takes part in it.
pub(crate) async fn conversation_for(
    state: &AppState,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Conversation, StatusCode> {
    let db = state.db.clone();
    let conversation = run_blocking(move || db.get_conversation(&conversation_id.to_string()))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?
        .into_conversation()
        .map_err(corrupt)?;

    if !conversation.involves(user_id) {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(conversation)
}

pub(crate) fn corrupt(e: anyhow::Error) -> StatusCode {
    error!("Corrupt record: {:#}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}
