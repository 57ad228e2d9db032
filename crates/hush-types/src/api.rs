use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

// -- JWT Claims --

/// JWT claims issued by the identity provider. Shared by the REST middleware
/// and the gateway handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub participant_a: Uuid,
    pub participant_b: Uuid,
    pub key_blob: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationLookup {
    pub a: Uuid,
    pub b: Uuid,
}

// -- Messages --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub sender_id: Uuid,
    pub ciphertext: String,
    pub iv: String,
}

impl SendMessageRequest {
    pub fn new(sender_id: Uuid, ciphertext: &[u8], iv: &[u8]) -> Self {
        Self {
            sender_id,
            ciphertext: B64.encode(ciphertext),
            iv: B64.encode(iv),
        }
    }
}

/// A stored message on the wire. Binary fields are base64 encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub ciphertext: String,
    pub iv: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessageResponse {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            conversation_id: msg.conversation_id,
            sender_id: msg.sender_id,
            ciphertext: B64.encode(&msg.ciphertext),
            iv: B64.encode(&msg.iv),
            created_at: msg.created_at,
        }
    }
}

impl TryFrom<MessageResponse> for Message {
    type Error = base64::DecodeError;

    fn try_from(resp: MessageResponse) -> Result<Self, Self::Error> {
        Ok(Self {
            id: resp.id,
            conversation_id: resp.conversation_id,
            sender_id: resp.sender_id,
            ciphertext: B64.decode(&resp.ciphertext)?,
            iv: B64.decode(&resp.iv)?,
            created_at: resp.created_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
