use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_db::models::{ConversationDigest, Delivery, NewMessage};
use parley_db::{Database, Store, StoreError};
use parley_gateway::{Dispatcher, Topic};
use parley_types::events::GatewayEvent;
use parley_types::identity::{self, ParticipantPair};
use parley_types::models::{ConversationSummary, Message, Profile};

use crate::{ProfileLookup, SyncConfig, SyncError};

/// Idle conversation gates are dropped once this many have accumulated.
const GATE_PRUNE_THRESHOLD: usize = 1024;

/// Sequences the store and the live update channel for sends and reads.
///
/// Cheap to clone; every clone shares the same store, dispatcher and ordering gates.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    store: Arc<dyn Store>,
    profiles: Arc<dyn ProfileLookup>,
    dispatcher: Dispatcher,
    config: SyncConfig,
    /// One gate per conversation, held from the store write until its
    /// message-level event is published, so subscribers see one conversation's
    /// events in commit order. Different conversations never wait on each other.
    gates: StdMutex<HashMap<ParticipantPair, Arc<Mutex<()>>>>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn Store>,
        profiles: Arc<dyn ProfileLookup>,
        dispatcher: Dispatcher,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                profiles,
                dispatcher,
                config,
                gates: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// One database acting as both the store and the profile source.
    pub fn with_database(db: Arc<Database>, dispatcher: Dispatcher, config: SyncConfig) -> Self {
        Self::new(db.clone(), db, dispatcher, config)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Send `content` from `sender_id` to `receiver_id`, creating their conversation
    /// on first contact.
    pub async fn send(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
    ) -> Result<Message, SyncError> {
        self.send_with_id(sender_id, receiver_id, content, Uuid::new_v4())
            .await
    }

    /// Like `send`, with a caller-chosen message id. Resubmitting the same id and
    /// content after a transient failure returns the stored message instead of a duplicate.
    pub async fn send_with_id(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        message_id: Uuid,
    ) -> Result<Message, SyncError> {
        // Everything rejectable is rejected before the store is touched.
        let content = validate_content(content, self.inner.config.max_message_len)?;
        let pair = identity::normalize(sender_id, receiver_id)?;
        if message_id.is_nil() {
            return Err(SyncError::Validation("message id must not be nil".into()));
        }

        let new = NewMessage {
            id: message_id,
            sender_id,
            receiver_id,
            content: content.to_string(),
            at: Utc::now(),
        };

        let delivery = {
            let _gate = self.lock_conversation(pair).await;

            debug!("Delivering message {} from {} to {}", message_id, sender_id, receiver_id);
            let delivery = match self.deliver(pair, new.clone()).await {
                Err(SyncError::Conflict(reason)) => {
                    debug!("Message {} hit a conflict ({}), refetching once", message_id, reason);
                    self.deliver(pair, new).await
                }
                other => other,
            }
            .map_err(|e| e.for_message(message_id))?;

            if delivery.created_conversation {
                info!(
                    "Conversation {} created between {} and {}",
                    delivery.conversation.id,
                    pair.low(),
                    pair.high()
                );
            }

            let watchers = self.inner.dispatcher.publish(
                Topic::Conversation(delivery.conversation.id),
                GatewayEvent::MessageCreate {
                    message: delivery.message.clone(),
                },
            );
            debug!("Message {} published to {} watchers", message_id, watchers);
            delivery
        };

        // Profile lookups happen after the gate is released; list rows may land
        // out of order and the session cache discards stale ones.
        self.publish_summaries(delivery.conversation.id, [sender_id, receiver_id])
            .await;
        Ok(delivery.message)
    }

    /// Full history of a conversation for `viewer_id`. Marks every message
    /// addressed to the viewer as read; this is the only place read state changes.
    pub async fn open_conversation(
        &self,
        viewer_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, SyncError> {
        identity::check_user_id(viewer_id)?;

        let conversation = self
            .run_store("get_conversation", move |store| store.get_conversation(conversation_id))
            .await?
            .filter(|c| c.has_participant(viewer_id))
            .ok_or_else(|| SyncError::NotFound(format!("conversation {}", conversation_id)))?;

        let pair = identity::normalize(conversation.participant_low, conversation.participant_high)?;

        let (messages, flipped) = {
            // Nothing may be delivered in this conversation between the flip and
            // its event, or a fresh unread message would be reported as read.
            let _gate = self.lock_conversation(pair).await;

            let flipped = self
                .run_store("mark_read", move |store| store.mark_read(conversation_id, viewer_id))
                .await?;
            let messages = self
                .run_store("messages_for_conversation", move |store| {
                    store.messages_for_conversation(conversation_id)
                })
                .await?;

            if flipped > 0 {
                debug!("{} read {} messages in {}", viewer_id, flipped, conversation_id);
                self.inner.dispatcher.publish(
                    Topic::Conversation(conversation_id),
                    GatewayEvent::MessagesRead {
                        conversation_id,
                        reader_id: viewer_id,
                    },
                );
            }
            (messages, flipped)
        };

        if flipped > 0 {
            self.publish_summaries(conversation_id, [pair.low(), pair.high()])
                .await;
        }

        Ok(messages)
    }

    /// The viewer's conversation list, most recently active first.
    pub async fn conversations(&self, viewer_id: Uuid) -> Result<Vec<ConversationSummary>, SyncError> {
        identity::check_user_id(viewer_id)?;

        let digests = self
            .run_store("digests_for_user", move |store| store.digests_for_user(viewer_id))
            .await?;

        let mut summaries = Vec::with_capacity(digests.len());
        for digest in digests {
            summaries.push(self.decorate(viewer_id, digest).await?);
        }
        Ok(summaries)
    }

    /// A single row of the viewer's conversation list.
    pub async fn summary(
        &self,
        viewer_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<ConversationSummary, SyncError> {
        let digest = self
            .run_store("digest_for", move |store| store.digest_for(conversation_id, viewer_id))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conversation {}", conversation_id)))?;
        self.decorate(viewer_id, digest).await
    }

    async fn deliver(&self, pair: ParticipantPair, new: NewMessage) -> Result<Delivery, SyncError> {
        self.run_store("deliver", move |store| store.deliver(pair, &new))
            .await
    }

    async fn lock_conversation(&self, pair: ParticipantPair) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.inner.gates.lock().unwrap_or_else(|e| e.into_inner());
            if gates.len() >= GATE_PRUNE_THRESHOLD {
                // Only the map holds an idle gate.
                gates.retain(|_, gate| Arc::strong_count(gate) > 1);
            }
            gates.entry(pair).or_default().clone()
        };
        gate.lock_owned().await
    }

    /// Push a personalised list row to each participant that has a live viewer subscription.
    async fn publish_summaries(&self, conversation_id: Uuid, viewers: [Uuid; 2]) {
        for viewer_id in viewers {
            let topic = Topic::Viewer(viewer_id);
            if self.inner.dispatcher.subscriber_count(topic) == 0 {
                continue;
            }

            match self.summary(viewer_id, conversation_id).await {
                Ok(summary) => {
                    self.inner
                        .dispatcher
                        .publish(topic, GatewayEvent::ConversationUpdate { summary });
                }
                Err(e) => {
                    warn!(
                        "Could not build summary of {} for {}: {}",
                        conversation_id, viewer_id, e
                    );
                }
            }
        }
    }

    async fn decorate(
        &self,
        viewer_id: Uuid,
        digest: ConversationDigest,
    ) -> Result<ConversationSummary, SyncError> {
        let counterpart_id = digest.conversation.counterpart(viewer_id).ok_or_else(|| {
            SyncError::NotFound(format!("conversation {}", digest.conversation.id))
        })?;
        let counterpart = self.resolve_profile(counterpart_id).await;

        Ok(ConversationSummary {
            conversation: digest.conversation,
            counterpart_id,
            counterpart,
            last_message: digest.last_message,
            unread_count: digest.unread_count,
        })
    }

    /// Profiles only decorate summaries; any failure degrades to the placeholder.
    async fn resolve_profile(&self, user_id: Uuid) -> Profile {
        let profiles = self.inner.profiles.clone();
        let task = tokio::task::spawn_blocking(move || profiles.get_profile(user_id));

        match tokio::time::timeout(self.inner.config.store_timeout, task).await {
            Ok(Ok(Ok(Some(profile)))) => profile,
            Ok(Ok(Ok(None))) => Profile::placeholder(),
            Ok(Ok(Err(e))) => {
                warn!("Profile lookup for {} failed: {}", user_id, e);
                Profile::placeholder()
            }
            Ok(Err(e)) => {
                error!("spawn_blocking join error: {}", e);
                Profile::placeholder()
            }
            Err(_) => {
                warn!("Profile lookup for {} timed out", user_id);
                Profile::placeholder()
            }
        }
    }

    /// Run a blocking store call off the async runtime, bounded by `store_timeout`.
    async fn run_store<T, F>(&self, op: &'static str, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.inner.store.clone();
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));

        match tokio::time::timeout(self.inner.config.store_timeout, task).await {
            Ok(Ok(result)) => result.map_err(|e| {
                debug!("Store call {} failed: {}", op, e);
                SyncError::from(e)
            }),
            Ok(Err(e)) => {
                error!("spawn_blocking join error: {}", e);
                Err(SyncError::Internal(format!("{} did not complete: {}", op, e)))
            }
            Err(_) => {
                warn!(
                    "Store call {} timed out after {:?}",
                    op, self.inner.config.store_timeout
                );
                Err(SyncError::transient(format!("{} timed out", op)))
            }
        }
    }
}

/// Trimmed content, or a validation error if nothing is left or it is too long.
fn validate_content(content: &str, max_len: Option<usize>) -> Result<&str, SyncError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Validation("message content is empty".into()));
    }

    if let Some(max_len) = max_len {
        let len = trimmed.chars().count();
        if len > max_len {
            return Err(SyncError::Validation(format!(
                "message is {} characters, limit is {}",
                len, max_len
            )));
        }
    }

    Ok(trimmed)
}
