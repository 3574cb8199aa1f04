use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_db::Store;
use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::{Dispatcher, EventSink, Subscription, Topic};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection: Identify handshake, then the event loop.
///
/// The connection is subscribed to its viewer topic for its whole lifetime and to
/// the conversation topics the client asks to watch. Every subscription is
/// released when the connection ends. Store lookups give up after `store_timeout`.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    store: Arc<dyn Store>,
    store_timeout: Duration,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let user_id = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} connected to gateway", user_id);

    if send_event(&mut sender, &GatewayEvent::Ready { user_id }).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, dispatcher, store, store_timeout, user_id).await;

    info!("{} disconnected from gateway", user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    store: Arc<dyn Store>,
    store_timeout: Duration,
    user_id: Uuid,
) {
    // All of this connection's subscriptions feed one sink.
    let (sink, mut events) = mpsc::unbounded_channel();
    let _viewer_subscription = dispatcher.attach(Topic::Viewer(user_id), sink.clone());

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
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
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let mut recv_task = tokio::spawn(async move {
        let mut watched: HashMap<Uuid, Subscription> = HashMap::new();

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher, &store, store_timeout, user_id, cmd, &sink, &mut watched)
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
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
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

async fn wait_for_identify(receiver: &mut SplitStream<WebSocket>, jwt_secret: &str) -> Option<Uuid> {
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use parley_types::api::Claims;

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    let user_id = token_data.claims.sub;
                    return (!user_id.is_nil()).then_some(user_id);
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    dispatcher: &Dispatcher,
    store: &Arc<dyn Store>,
    store_timeout: Duration,
    user_id: Uuid,
    cmd: GatewayCommand,
    sink: &EventSink,
    watched: &mut HashMap<Uuid, Subscription>,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::WatchConversation { conversation_id } => {
            if watched.contains_key(&conversation_id) {
                return;
            }
            if !is_participant(store, store_timeout, conversation_id, user_id).await {
                warn!("{} tried to watch conversation {} they are not part of", user_id, conversation_id);
                return;
            }
            let subscription = dispatcher.attach(Topic::Conversation(conversation_id), sink.clone());
            watched.insert(conversation_id, subscription);
            info!("{} watching conversation {}", user_id, conversation_id);
        }

        GatewayCommand::UnwatchConversation { conversation_id } => {
            if watched.remove(&conversation_id).is_some() {
                info!("{} stopped watching conversation {}", user_id, conversation_id);
            }
        }
    }
}

/// Whether `user_id` belongs to the conversation. Any failure, including a
/// store that does not answer within `timeout`, counts as no.
async fn is_participant(
    store: &Arc<dyn Store>,
    timeout: Duration,
    conversation_id: Uuid,
    user_id: Uuid,
) -> bool {
    let store = store.clone();
    let task = tokio::task::spawn_blocking(move || store.get_conversation(conversation_id));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(Some(conversation)))) => conversation.has_participant(user_id),
        Ok(Ok(Ok(None))) => false,
        Ok(Ok(Err(e))) => {
            warn!("Participant check for conversation {} failed: {}", conversation_id, e);
            false
        }
        Ok(Err(e)) => {
            error!("spawn_blocking join error: {}", e);
            false
        }
        Err(_) => {
            warn!(
                "Participant check for conversation {} timed out after {:?}",
                conversation_id, timeout
            );
            false
        }
    }
}
