//! Middleware bridge seams.
//!
//! A session never talks to the middleware directly. Advertised topics are
//! turned into bridges by a [`BridgeFactory`]; the session owns the returned
//! handles and drops them on teardown, which severs their middleware link.

use bytes::Bytes;
use serialgate_protocol::{TopicId, TopicInfo};
use tokio::sync::mpsc;

use crate::session::OutboundRequest;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("topic {topic} already carries {existing}, device advertised {advertised}")]
    TypeMismatch {
        topic: String,
        existing: String,
        advertised: String,
    },
    #[error("topic id {0} is reserved for control frames")]
    ReservedTopic(TopicId),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] serialgate_protocol::ProtocolError),
    #[error("device write queue full")]
    QueueFull,
    #[error("session closed")]
    SessionClosed,
}

/// Device -> middleware: publishes every frame the device sends on a topic.
pub trait PublisherBridge: Send {
    fn topic(&self) -> &TopicInfo;

    fn forward(&self, payload: Bytes) -> Result<(), BridgeError>;
}

/// Middleware -> device: a live subscription feeding a [`DeviceSink`].
/// Dropping the handle ends the subscription.
pub trait SubscriberBridge: Send {
    fn topic(&self) -> &TopicInfo;
}

/// Creates bridges for advertised topics.
pub trait BridgeFactory: Send + Sync {
    fn publisher(&self, info: &TopicInfo) -> Result<Box<dyn PublisherBridge>, BridgeError>;

    fn subscriber(
        &self,
        info: &TopicInfo,
        sink: DeviceSink,
    ) -> Result<Box<dyn SubscriberBridge>, BridgeError>;
}

/// Write callback handed to subscriber bridges.
///
/// Safe to use from any task or thread: it only enqueues a request on the
/// owning session's channel, the session encodes and writes it in order.
#[derive(Debug, Clone)]
pub struct DeviceSink {
    topic_id: TopicId,
    tx: mpsc::Sender<OutboundRequest>,
}

impl DeviceSink {
    pub(crate) fn new(topic_id: TopicId, tx: mpsc::Sender<OutboundRequest>) -> Self {
        Self { topic_id, tx }
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }

    /// Enqueue a serialized message, waiting for queue space.
    pub async fn send(&self, payload: Bytes) -> Result<(), BridgeError> {
        self.tx
            .send(OutboundRequest {
                topic_id: self.topic_id,
                payload,
            })
            .await
            .map_err(|_| BridgeError::SessionClosed)
    }

    /// Enqueue without waiting; fails when the queue is full.
    pub fn try_send(&self, payload: Bytes) -> Result<(), BridgeError> {
        self.tx
            .try_send(OutboundRequest {
                topic_id: self.topic_id,
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => BridgeError::SessionClosed,
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
