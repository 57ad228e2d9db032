use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hush_db::Database;
use hush_types::api::Claims;
use hush_types::events::{GatewayCommand, GatewayEvent};

use crate::auth::verify_token;
use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A client must identify within this window after the upgrade.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Conversations this connection forwards inserts for.
type Subscriptions = Arc<RwLock<HashSet<Uuid>>>;

/// Handle a single WebSocket connection: Identify handshake, then the event loop.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let claims = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(claims) => claims,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };
    let user_id = claims.sub;
    let username = claims.username;

    if let Err(e) = record_user(&db, user_id, &username).await {
        warn!("Could not record user {} ({}): {}", username, user_id, e);
    }

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    dispatcher.connection_opened();
    run_connection_loop(sender, receiver, dispatcher.clone(), db, user_id, username.clone()).await;
    dispatcher.connection_closed();

    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
    username: String,
) {
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    // Replies to this connection's own commands
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    let mut broadcast_rx = dispatcher.subscribe();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward subscribed inserts + direct replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Inserts were lost for this client; closing makes it reload history.
                            warn!("Gateway connection lagged by {} events, closing", n);
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };

                    let wanted = match &event {
                        GatewayEvent::MessageCreate { message } => {
                            is_subscribed(&send_subscriptions, message.conversation_id)
                        }
                        _ => false,
                    };
                    if !wanted {
                        continue;
                    }

                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                reply = direct_rx.recv() => {
                    let Some(reply) = reply else { break };
                    if send_event(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = sender.close().await;
    });

    // Read commands from client
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&db, user_id, &username_recv, cmd, &subscriptions, &direct_tx)
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        let _ = direct_tx.send(GatewayEvent::Error {
                            message: format!("bad command: {}", e),
                        });
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    debug!("{} ({}) connection loop finished", username, user_id);
}

async fn wait_for_identify(receiver: &mut SplitStream<WebSocket>, jwt_secret: &str) -> Option<Claims> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return verify_token(jwt_secret, &token);
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify)
        .await
        .ok()
        .flatten()
}

async fn handle_command(
    db: &Arc<Database>,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
    subscriptions: &Subscriptions,
    direct_tx: &mpsc::UnboundedSender<GatewayEvent>,
) {
    let reply = match cmd {
        GatewayCommand::Identify { .. } => return, // Already handled

        GatewayCommand::Subscribe { conversation_id } => {
            match is_participant(db, conversation_id, user_id).await {
                Ok(true) => {
                    if let Ok(mut subs) = subscriptions.write() {
                        subs.insert(conversation_id);
                    }
                    info!("{} ({}) subscribed to {}", username, user_id, conversation_id);
                    GatewayEvent::Subscribed { conversation_id }
                }
                Ok(false) => {
                    warn!(
                        "{} ({}) tried to subscribe to foreign conversation {}",
                        username, user_id, conversation_id
                    );
                    GatewayEvent::Error {
                        message: format!("not a participant of conversation {}", conversation_id),
                    }
                }
                Err(e) => {
                    error!("Subscription lookup for {} failed: {}", conversation_id, e);
                    GatewayEvent::Error {
                        message: "subscription lookup failed".into(),
                    }
                }
            }
        }

        GatewayCommand::Unsubscribe { conversation_id } => {
            if let Ok(mut subs) = subscriptions.write() {
                subs.remove(&conversation_id);
            }
            info!("{} ({}) unsubscribed from {}", username, user_id, conversation_id);
            GatewayEvent::Unsubscribed { conversation_id }
        }
    };

    let _ = direct_tx.send(reply);
}

fn is_subscribed(subscriptions: &Subscriptions, conversation_id: Uuid) -> bool {
    subscriptions
        .read()
        .map(|subs| subs.contains(&conversation_id))
        .unwrap_or(false)
}

async fn is_participant(db: &Arc<Database>, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
    let db = db.clone();
    let row = tokio::task::spawn_blocking(move || db.get_conversation(&conversation_id.to_string()))
        .await
        .map_err(|e| anyhow!("spawn_blocking join error: {}", e))??;

    match row {
        Some(row) => Ok(row.into_conversation()?.involves(user_id)),
        None => Ok(false),
    }
}

async fn record_user(db: &Arc<Database>, user_id: Uuid, username: &str) -> Result<()> {
    let db = db.clone();
    let username = username.to_string();
    tokio::task::spawn_blocking(move || db.upsert_user(&user_id.to_string(), &username))
        .await
        .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> Result<()> {
    let text = serde_json::to_string(event)?;
    sender.send(Message::Text(text.into())).await?;
    Ok(())
}
