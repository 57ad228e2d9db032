//! [`BackendPort`] over the hush server: REST for records, one gateway
//! WebSocket per live subscription.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use hush_crypto::PortableKey;
use hush_types::api::{CreateConversationRequest, MessageResponse, SendMessageRequest};
use hush_types::events::{GatewayCommand, GatewayEvent};
use hush_types::models::{Conversation, ConversationSummary, Message, UserIdentity};

use crate::backend::{BackendPort, Subscription};
use crate::config::ClientConfig;
use crate::error::{NetworkError, SubscriptionError};

/// Identify + Subscribe must both be acknowledged within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RemoteBackend {
    http: Client,
    base: Url,
    gateway: Url,
    token: String,
}

impl RemoteBackend {
    pub fn new(base_url: &str, access_token: impl Into<String>) -> Result<Self, NetworkError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut gateway = base.join("gateway")?;
        let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
        gateway
            .set_scheme(scheme)
            .map_err(|_| NetworkError::Transport(format!("cannot derive gateway url from {}", base)))?;

        Ok(Self {
            http: Client::new(),
            base,
            gateway,
            token: access_token.into(),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, NetworkError> {
        Self::new(config.server_url.as_str(), config.access_token.clone())
    }

    pub fn gateway_url(&self) -> &Url {
        &self.gateway
    }

    fn url(&self, path: &str) -> Result<Url, NetworkError> {
        Ok(self.base.join(path)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, NetworkError> {
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Like `get_json`, with 404 meaning "no such record".
    async fn get_optional<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, NetworkError> {
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, url: Url, body: &B) -> Result<T, NetworkError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Connect, identify and subscribe. Inserts that arrive before the
    /// acknowledgement are returned alongside the stream.
    async fn open_gateway(&self, conversation_id: Uuid) -> Result<(WsStream, Vec<Message>), String> {
        let (mut stream, _) = tokio_tungstenite::connect_async(self.gateway.as_str())
            .await
            .map_err(|e| format!("connect failed: {}", e))?;

        send_command(
            &mut stream,
            &GatewayCommand::Identify {
                token: self.token.clone(),
            },
        )
        .await?;
        loop {
            match next_event(&mut stream).await? {
                Some(GatewayEvent::Ready { user_id, .. }) => {
                    debug!("Gateway ready for {}", user_id);
                    break;
                }
                Some(GatewayEvent::Error { message }) => return Err(message),
                Some(_) => continue,
                None => return Err("gateway closed during identify".into()),
            }
        }

        send_command(&mut stream, &GatewayCommand::Subscribe { conversation_id }).await?;
        let mut early = Vec::new();
        loop {
            match next_event(&mut stream).await? {
                Some(GatewayEvent::Subscribed { conversation_id: acked }) if acked == conversation_id => break,
                Some(GatewayEvent::MessageCreate { message }) if message.conversation_id == conversation_id => {
                    match Message::try_from(message) {
                        Ok(message) => early.push(message),
                        Err(e) => warn!("Malformed insert on {}: {}", conversation_id, e),
                    }
                }
                Some(GatewayEvent::Error { message }) => return Err(message),
                Some(_) => continue,
                None => return Err("gateway closed during subscribe".into()),
            }
        }

        Ok((stream, early))
    }
}

async fn check(response: Response) -> Result<Response, NetworkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(NetworkError::Unauthenticated),
        StatusCode::CONFLICT => Err(NetworkError::Conflict),
        _ => {
            let body = response.text().await.unwrap_or_default();
            let reason = if body.is_empty() {
                status.canonical_reason().unwrap_or("unknown").to_string()
            } else {
                body
            };
            Err(NetworkError::Status {
                status: status.as_u16(),
                reason,
            })
        }
    }
}

async fn send_command(stream: &mut WsStream, command: &GatewayCommand) -> Result<(), String> {
    let text = serde_json::to_string(command).map_err(|e| e.to_string())?;
    stream
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| format!("send failed: {}", e))
}

/// Next gateway event, skipping control frames and unparseable text.
/// `Ok(None)` when the server closed the connection.
async fn next_event(stream: &mut WsStream) -> Result<Option<GatewayEvent>, String> {
    while let Some(frame) = stream.next().await {
        match frame.map_err(|e| e.to_string())? {
            WsMessage::Text(text) => match serde_json::from_str::<GatewayEvent>(text.as_str()) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => warn!("Unparseable gateway frame: {}", e),
            },
            WsMessage::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

/// Pumps inserts into the subscription until cancelled or the socket ends.
/// Dropping `events` on exit is what tells the subscription it went away.
async fn forward(
    mut stream: WsStream,
    conversation_id: Uuid,
    events: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = send_command(&mut stream, &GatewayCommand::Unsubscribe { conversation_id }).await;
                let _ = stream.close(None).await;
                debug!("Gateway subscription for {} closed", conversation_id);
                return;
            }
            event = next_event(&mut stream) => match event {
                Ok(Some(GatewayEvent::MessageCreate { message })) => {
                    if message.conversation_id != conversation_id {
                        continue;
                    }
                    match Message::try_from(message) {
                        Ok(message) => {
                            if events.send(message).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Malformed insert on {}: {}", conversation_id, e),
                    }
                }
                Ok(Some(GatewayEvent::Error { message })) => {
                    warn!("Gateway error on {}: {}", conversation_id, message);
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!("Gateway closed subscription for {}", conversation_id);
                    return;
                }
                Err(e) => {
                    warn!("Gateway connection for {} failed: {}", conversation_id, e);
                    return;
                }
            }
        }
    }
}

fn to_message(response: MessageResponse) -> Result<Message, NetworkError> {
    Message::try_from(response).map_err(|e| NetworkError::Decode(e.to_string()))
}

/// History with undecodable records dropped. One bad row must not hide the
/// rest of the conversation.
fn decode_history(conversation_id: Uuid, responses: Vec<MessageResponse>) -> Vec<Message> {
    responses
        .into_iter()
        .filter_map(|response| {
            let id = response.id;
            match to_message(response) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Skipping malformed message {} in {}: {}", id, conversation_id, e);
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl BackendPort for RemoteBackend {
    async fn current_user(&self) -> Result<Option<UserIdentity>, NetworkError> {
        match self.get_json(self.url("me")?).await {
            Ok(user) => Ok(Some(user)),
            Err(NetworkError::Unauthenticated) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_conversation(
        &self,
        participant_a: Uuid,
        participant_b: Uuid,
        key_blob: &PortableKey,
    ) -> Result<Conversation, NetworkError> {
        let body = CreateConversationRequest {
            participant_a,
            participant_b,
            key_blob: key_blob.as_str().to_string(),
        };
        self.post_json(self.url("conversations")?, &body).await
    }

    async fn find_conversation(
        &self,
        participant_a: Uuid,
        participant_b: Uuid,
    ) -> Result<Option<Conversation>, NetworkError> {
        let mut url = self.url("conversations/lookup")?;
        url.query_pairs_mut()
            .append_pair("a", &participant_a.to_string())
            .append_pair("b", &participant_b.to_string());
        self.get_optional(url).await
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>, NetworkError> {
        self.get_json(self.url(&format!("users/{}/conversations", user_id))?)
            .await
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        ciphertext: &[u8],
        iv: &[u8],
    ) -> Result<Message, NetworkError> {
        let url = self.url(&format!("conversations/{}/messages", conversation_id))?;
        let body = SendMessageRequest::new(sender_id, ciphertext, iv);
        let stored: MessageResponse = self.post_json(url, &body).await?;
        to_message(stored)
    }

    async fn fetch_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, NetworkError> {
        let url = self.url(&format!("conversations/{}/messages", conversation_id))?;
        let responses: Vec<MessageResponse> = self.get_json(url).await?;
        Ok(decode_history(conversation_id, responses))
    }

    async fn subscribe(&self, conversation_id: Uuid) -> Result<Subscription, SubscriptionError> {
        let (stream, early) = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.open_gateway(conversation_id))
            .await
            .map_err(|_| "gateway handshake timed out".to_string())
            .and_then(|result| result)
            .map_err(|reason| SubscriptionError::Open {
                conversation_id,
                reason,
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        for message in early {
            let _ = tx.send(message);
        }
        let cancel = CancellationToken::new();
        tokio::spawn(forward(stream, conversation_id, tx, cancel.clone()));
        info!("Subscribed to conversation {} via gateway", conversation_id);

        Ok(Subscription::new(conversation_id, rx, cancel))
    }

    async fn unsubscribe(&self, mut subscription: Subscription) {
        subscription.cancel();
    }
}
