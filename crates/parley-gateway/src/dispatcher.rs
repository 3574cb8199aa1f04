use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// What a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Conversation-list updates for one user (every conversation they take part in).
    Viewer(Uuid),
    /// Message-level events for one open conversation view.
    Conversation(Uuid),
}

pub type EventSink = mpsc::UnboundedSender<GatewayEvent>;

/// Routes events to the sinks registered for a topic.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// topic -> (subscription id -> sink)
    topics: RwLock<HashMap<Topic, HashMap<Uuid, EventSink>>>,
}

impl DispatcherInner {
    fn remove(&self, topic: Topic, id: Uuid) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        if let Some(sinks) = topics.get_mut(&topic) {
            sinks.remove(&id);
            if sinks.is_empty() {
                topics.remove(&topic);
            }
        }
    }
}

/// A live registration. Dropping it unregisters the sink from its topic.
pub struct Subscription {
    id: Uuid,
    topic: Topic,
    dispatcher: Weak<DispatcherInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.remove(self.topic, self.id);
            trace!("Released subscription {} on {:?}", self.id, self.topic);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sink` on `topic`. Several topics may share one sink.
    pub fn attach(&self, topic: Topic, sink: EventSink) -> Subscription {
        let id = Uuid::new_v4();
        self.inner
            .topics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic)
            .or_default()
            .insert(id, sink);

        trace!("Attached subscription {} on {:?}", id, topic);
        Subscription {
            id,
            topic,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// Register a fresh sink on `topic` and hand back its receiving end.
    pub fn subscribe(&self, topic: Topic) -> (Subscription, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.attach(topic, tx), rx)
    }

    /// Deliver an event to every sink on `topic`. Returns the number of sinks reached.
    /// Sinks whose receiver has gone away are pruned.
    pub fn publish(&self, topic: Topic, event: GatewayEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let topics = self.inner.topics.read().unwrap_or_else(|e| e.into_inner());
            let Some(sinks) = topics.get(&topic) else {
                return 0;
            };
            for (id, sink) in sinks {
                if sink.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        for id in closed {
            debug!("Pruning closed sink {} on {:?}", id, topic);
            self.inner.remove(topic, id);
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&topic)
            .map_or(0, HashMap::len)
    }
}
