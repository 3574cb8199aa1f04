use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use parley_gateway::dispatcher::EventSink;
use parley_gateway::{Subscription, Topic};
use parley_sync::{SyncError, Synchronizer};
use parley_types::events::GatewayEvent;
use parley_types::identity;
use parley_types::models::{ConversationSummary, Message};

use crate::cache::{CacheEvent, SessionCache};

/// One viewer's live view of their conversations.
///
/// User actions and pushed events both mutate the same cache under one lock.
/// Dropping the session releases every subscription it holds.
pub struct ViewerSession {
    viewer_id: Uuid,
    sync: Synchronizer,
    cache: Arc<Mutex<SessionCache>>,
    revision: Arc<watch::Sender<u64>>,
    /// Shared by the viewer subscription and every watched conversation.
    sink: EventSink,
    _viewer_subscription: Subscription,
    watched: HashMap<Uuid, Subscription>,
    pump: JoinHandle<()>,
}

impl ViewerSession {
    /// Subscribe to the viewer's list updates, then load the list. Subscribing
    /// first means no update can fall between the fetch and the subscription.
    pub async fn connect(viewer_id: Uuid, sync: Synchronizer) -> Result<Self, SyncError> {
        identity::check_user_id(viewer_id)?;

        let (sink, events) = mpsc::unbounded_channel();
        let viewer_subscription = sync
            .dispatcher()
            .attach(Topic::Viewer(viewer_id), sink.clone());

        let cache = Arc::new(Mutex::new(SessionCache::new()));
        let (revision, _) = watch::channel(0u64);
        let revision = Arc::new(revision);
        let pump = tokio::spawn(pump_events(events, cache.clone(), revision.clone()));

        let session = Self {
            viewer_id,
            sync,
            cache,
            revision,
            sink,
            _viewer_subscription: viewer_subscription,
            watched: HashMap::new(),
            pump,
        };

        // On error the session is dropped here, which aborts the pump.
        session.refresh().await?;
        info!("Session opened for {}", viewer_id);
        Ok(session)
    }

    pub fn viewer_id(&self) -> Uuid {
        self.viewer_id
    }

    /// Send to `receiver_id`. The returned message is merged right away; its
    /// later push is a no-op. On a transient failure, retry through
    /// `send_with_id` with the error's `message_id`.
    pub async fn send(&self, receiver_id: Uuid, content: &str) -> Result<Message, SyncError> {
        let message = self.sync.send(self.viewer_id, receiver_id, content).await?;
        self.apply(CacheEvent::Message(message.clone())).await;
        Ok(message)
    }

    /// `send` with a caller-chosen id, for retrying after a transient failure.
    pub async fn send_with_id(
        &self,
        receiver_id: Uuid,
        content: &str,
        message_id: Uuid,
    ) -> Result<Message, SyncError> {
        let message = self
            .sync
            .send_with_id(self.viewer_id, receiver_id, content, message_id)
            .await?;
        self.apply(CacheEvent::Message(message.clone())).await;
        Ok(message)
    }

    /// Start watching a conversation and load its history, marking it read.
    /// Returns the merged history, which may already include pushes that
    /// arrived during the fetch.
    pub async fn open_conversation(&mut self, conversation_id: Uuid) -> Result<Vec<Message>, SyncError> {
        let newly_watched = !self.watched.contains_key(&conversation_id);
        if newly_watched {
            let subscription = self
                .sync
                .dispatcher()
                .attach(Topic::Conversation(conversation_id), self.sink.clone());
            self.watched.insert(conversation_id, subscription);
        }

        // An empty history has to exist before the fetch starts, or a message
        // pushed while it is in flight would be dropped and never fetched.
        let seeded = {
            let mut cache = self.cache.lock().await;
            let seeded = !cache.is_loaded(conversation_id);
            if seeded {
                cache.apply(CacheEvent::History {
                    conversation_id,
                    messages: Vec::new(),
                });
            }
            seeded
        };

        let messages = match self.sync.open_conversation(self.viewer_id, conversation_id).await {
            Ok(messages) => messages,
            Err(e) => {
                if newly_watched {
                    self.watched.remove(&conversation_id);
                }
                if seeded {
                    self.cache.lock().await.forget(conversation_id);
                }
                return Err(e);
            }
        };

        let mut cache = self.cache.lock().await;
        let merged = cache.apply(CacheEvent::History {
            conversation_id,
            messages,
        });
        if seeded || merged {
            self.bump();
        }
        debug!("{} opened {}", self.viewer_id, conversation_id);
        Ok(cache.messages(conversation_id).map(<[Message]>::to_vec).unwrap_or_default())
    }

    /// Stop watching a conversation. Its history is dropped since it would go
    /// stale; the list subscription stays. Returns whether it was being watched.
    pub async fn close_conversation(&mut self, conversation_id: Uuid) -> bool {
        let was_watched = self.watched.remove(&conversation_id).is_some();
        if self.cache.lock().await.forget(conversation_id) {
            self.bump();
        }
        if was_watched {
            debug!("{} closed {}", self.viewer_id, conversation_id);
        }
        was_watched
    }

    /// Reload the conversation list, e.g. after a `NotFound`.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let list = self.sync.conversations(self.viewer_id).await?;
        self.apply(CacheEvent::ConversationList(list)).await;
        Ok(())
    }

    pub fn is_watching(&self, conversation_id: Uuid) -> bool {
        self.watched.contains_key(&conversation_id)
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.cache.lock().await.conversations().to_vec()
    }

    pub async fn messages(&self, conversation_id: Uuid) -> Option<Vec<Message>> {
        self.cache
            .lock()
            .await
            .messages(conversation_id)
            .map(<[Message]>::to_vec)
    }

    pub async fn snapshot(&self) -> SessionCache {
        self.cache.lock().await.clone()
    }

    /// Ticks whenever the cache changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// End the session. The pump and every subscription are released by `Drop`,
    /// which this consumes the session to trigger.
    pub fn disconnect(self) {
        info!("Session closed for {}", self.viewer_id);
    }

    async fn apply(&self, event: CacheEvent) {
        if self.cache.lock().await.apply(event) {
            self.bump();
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<GatewayEvent>,
    cache: Arc<Mutex<SessionCache>>,
    revision: Arc<watch::Sender<u64>>,
) {
    while let Some(event) = events.recv().await {
        let Some(event) = CacheEvent::from_gateway(event) else {
            continue;
        };
        if cache.lock().await.apply(event) {
            revision.send_modify(|rev| *rev += 1);
        }
    }
}
