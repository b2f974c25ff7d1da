//! Broker contract and an in-process implementation.
//!
//! The broker moves opaque bytes between nodes on named topics. The core
//! assumes at-least-once delivery with no ordering across messages and does
//! not retry failed publishes itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::hooks::BoxFuture;

/// Callback invoked for every payload delivered on a subscribed topic.
pub type BrokerHandler = Arc<dyn Fn(Bytes) -> BoxFuture<()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// Message broker used for control envelopes and channel publications.
pub trait Broker: Send + Sync {
    /// Hand `payload` to the broker for delivery to every subscriber of
    /// `topic`. Returns once the broker accepted it.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Deliver payloads published on `topic` to `handler`, replacing any
    /// previous handler this broker handle had for the topic.
    fn subscribe(&self, topic: &str, handler: BrokerHandler) -> Result<(), BrokerError>;

    /// Stop delivering `topic` to this broker handle.
    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;
}

struct Subscriber {
    handle: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_handle: AtomicU64,
    fail_publish: AtomicBool,
    published: AtomicU64,
}

/// Shared in-process bus. Every [`MemoryBroker`] created from the same bus
/// sees the same topics, so several nodes can run in one process.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker handle attached to this bus.
    pub fn broker(&self) -> MemoryBroker {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        MemoryBroker {
            bus: self.clone(),
            handle,
        }
    }

    /// Make every subsequent publish fail until reset.
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::Relaxed);
    }

    /// Total payloads accepted since the bus was created.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Number of broker handles subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.inner.topics.read().expect("bus topics lock");
        topics.get(topic).map(|subs| subs.len()).unwrap_or(0)
    }

    fn remove(&self, topic: &str, handle: u64) {
        let mut topics = self.inner.topics.write().expect("bus topics lock");
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.handle != handle);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// One node's handle on a [`MemoryBus`].
///
/// Each subscription gets its own delivery task, so handlers for one topic
/// run one payload at a time in publish order while different topics and
/// different handles proceed independently.
pub struct MemoryBroker {
    bus: MemoryBus,
    handle: u64,
}

impl Broker for MemoryBroker {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let inner = &self.bus.inner;
        if inner.fail_publish.load(Ordering::Relaxed) {
            return Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: "bus unavailable".to_string(),
            });
        }

        let topics = inner.topics.read().expect("bus topics lock");
        if let Some(subs) = topics.get(topic) {
            for sub in subs {
                // A closed receiver means the subscriber is going away.
                let _ = sub.tx.send(payload.clone());
            }
            trace!(%topic, subscribers = subs.len(), "payload published");
        }
        inner.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: BrokerHandler) -> Result<(), BrokerError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        {
            let mut topics = self.bus.inner.topics.write().expect("bus topics lock");
            let subs = topics.entry(topic.to_string()).or_default();
            subs.retain(|s| s.handle != self.handle);
            subs.push(Subscriber {
                handle: self.handle,
                tx,
            });
        }

        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                handler(payload).await;
            }
        });

        debug!(%topic, handle = self.handle, "subscribed to topic");
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.bus.remove(topic, self.handle);
        debug!(%topic, handle = self.handle, "unsubscribed from topic");
        Ok(())
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        let mut topics = self.bus.inner.topics.write().expect("bus topics lock");
        for subs in topics.values_mut() {
            subs.retain(|s| s.handle != self.handle);
        }
        topics.retain(|_, subs| !subs.is_empty());
    }
}
