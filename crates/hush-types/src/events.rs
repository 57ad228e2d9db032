use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::MessageResponse;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// The connection now receives inserts for this conversation
    Subscribed { conversation_id: Uuid },

    /// The connection no longer receives inserts for this conversation
    Unsubscribed { conversation_id: Uuid },

    /// A new encrypted message was stored
    MessageCreate { message: MessageResponse },

    /// A command was rejected
    Error { message: String },
}

impl GatewayEvent {
    /// Returns the conversation this event is scoped to.
    /// Events that return `None` are connection-level.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreate { message } => Some(message.conversation_id),
            Self::Subscribed { conversation_id } | Self::Unsubscribed { conversation_id } => {
                Some(*conversation_id)
            }
            Self::Ready { .. } | Self::Error { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Start receiving inserts for a conversation the caller participates in
    Subscribe { conversation_id: Uuid },

    /// Stop receiving inserts for a conversation
    Unsubscribe { conversation_id: Uuid },
}
