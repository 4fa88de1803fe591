//! In-process topic pub/sub.
//!
//! Every subscriber owns an unbounded FIFO queue, so a publisher never
//! blocks and a subscriber sees one topic's messages in publication order.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::event::Event;
use crate::RuntimeError;

/// A published payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub uuid: String,
    pub payload: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// Message carrying one serialized event.
    pub fn from_event(event: &Event) -> Result<Self, RuntimeError> {
        let mut message = Self::new(event.to_json()?);
        message
            .metadata
            .insert("event_type".into(), event.event_type().into());
        Ok(message)
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct BusInner {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Shared message bus. Clones refer to the same bus.
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to every current subscriber of `topic`.
    ///
    /// Publishing to a topic nobody listens on is not an error.
    pub fn publish(&self, topic: &str, message: Message) -> Result<(), RuntimeError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::BusClosed);
        }
        let mut topics = self.inner.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|s| s.tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    /// Serialize and publish one event.
    pub fn publish_event(&self, topic: &str, event: &Event) -> Result<(), RuntimeError> {
        self.publish(topic, Message::from_event(event)?)
    }

    /// New subscription to `topic`. Returns its id and its queue.
    pub fn subscribe(&self, topic: &str) -> Result<(u64, mpsc::UnboundedReceiver<Message>), RuntimeError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::BusClosed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        Ok((id, rx))
    }

    /// Drop one subscription. Its queue still yields what was already
    /// delivered, then ends.
    pub fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.inner.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// Refuse further traffic and end every subscription.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.topics.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics: Vec<String> = self.inner.topics.lock().keys().cloned().collect();
        f.debug_struct("Bus")
            .field("topics", &topics)
            .field("closed", &self.is_closed())
            .finish()
    }
}
