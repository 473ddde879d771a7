//! In-process publish/subscribe bus.
//!
//! Topics are keyed by name and carry one message type each. Device
//! publications on a topic reach every subscriber of that name, whether a
//! host-side receiver or another device's subscriber bridge.
//!
//! A topic lives while a publisher bridge or a receiver holds it. Unused
//! topics are pruned on the next lookup, after which the name may be taken
//! by another message type.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serialgate_protocol::TopicInfo;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bridge::{BridgeError, BridgeFactory, DeviceSink, PublisherBridge, SubscriberBridge};

/// Messages buffered per topic before slow subscribers start lagging.
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

struct TopicChannel {
    message_type: String,
    tx: broadcast::Sender<Bytes>,
    /// One clone per live publisher bridge.
    publishers: Arc<()>,
}

impl TopicChannel {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.publishers) > 1 || self.tx.receiver_count() > 0
    }
}

#[derive(Clone)]
pub struct LocalBus {
    topics: Arc<Mutex<HashMap<String, TopicChannel>>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicChannel>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up or create `topic`, returning its sender and publisher claim.
    fn channel(
        &self,
        topic: &str,
        message_type: &str,
    ) -> Result<(broadcast::Sender<Bytes>, Arc<()>), BridgeError> {
        let mut topics = self.lock();
        topics.retain(|name, ch| {
            let keep = ch.in_use();
            if !keep {
                tracing::debug!(topic = %name, "bus topic pruned");
            }
            keep
        });

        if let Some(existing) = topics.get(topic) {
            if existing.message_type != message_type {
                return Err(BridgeError::TypeMismatch {
                    topic: topic.to_string(),
                    existing: existing.message_type.clone(),
                    advertised: message_type.to_string(),
                });
            }
            return Ok((existing.tx.clone(), existing.publishers.clone()));
        }

        let (tx, _) = broadcast::channel(self.capacity);
        let publishers = Arc::new(());
        topics.insert(
            topic.to_string(),
            TopicChannel {
                message_type: message_type.to_string(),
                tx: tx.clone(),
                publishers: publishers.clone(),
            },
        );
        tracing::debug!(topic, message_type, "bus topic created");
        Ok((tx, publishers))
    }

    /// Publish from the host side. Returns how many subscribers received it.
    pub fn publish(
        &self,
        topic: &str,
        message_type: &str,
        payload: Bytes,
    ) -> Result<usize, BridgeError> {
        let (tx, _) = self.channel(topic, message_type)?;
        Ok(tx.send(payload).unwrap_or(0))
    }

    /// Subscribe from the host side.
    pub fn subscribe(
        &self,
        topic: &str,
        message_type: &str,
    ) -> Result<broadcast::Receiver<Bytes>, BridgeError> {
        let (tx, _) = self.channel(topic, message_type)?;
        Ok(tx.subscribe())
    }

    #[cfg(test)]
    fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl BridgeFactory for LocalBus {
    fn publisher(&self, info: &TopicInfo) -> Result<Box<dyn PublisherBridge>, BridgeError> {
        let (tx, claim) = self.channel(&info.topic_name, &info.message_type)?;
        Ok(Box::new(LocalPublisher {
            info: info.clone(),
            tx,
            _claim: claim,
        }))
    }

    fn subscriber(
        &self,
        info: &TopicInfo,
        sink: DeviceSink,
    ) -> Result<Box<dyn SubscriberBridge>, BridgeError> {
        let (tx, _) = self.channel(&info.topic_name, &info.message_type)?;
        let mut rx = tx.subscribe();
        let topic = info.topic_name.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if sink.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%topic, skipped, "device subscriber lagging, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Box::new(LocalSubscriber {
            info: info.clone(),
            task,
        }))
    }
}

struct LocalPublisher {
    info: TopicInfo,
    tx: broadcast::Sender<Bytes>,
    _claim: Arc<()>,
}

impl PublisherBridge for LocalPublisher {
    fn topic(&self) -> &TopicInfo {
        &self.info
    }

    fn forward(&self, payload: Bytes) -> Result<(), BridgeError> {
        let len = payload.len();
        let receivers = self.tx.send(payload).unwrap_or(0);
        tracing::debug!(topic = %self.info.topic_name, len, receivers, "device publication");
        Ok(())
    }
}

struct LocalSubscriber {
    info: TopicInfo,
    task: JoinHandle<()>,
}

impl SubscriberBridge for LocalSubscriber {
    fn topic(&self) -> &TopicInfo {
        &self.info
    }
}

impl Drop for LocalSubscriber {
    fn drop(&mut self) {
        self.task.abort();
    }
}
