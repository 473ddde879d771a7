//! Topic registry -- topic id to handler dispatch table.
//!
//! Control ids route back to the session, which owns the control handlers.
//! User ids route to bridges created from device advertisements. At most one
//! handler per id; registering again replaces (and drops) the previous one.

use std::collections::HashMap;

use bytes::Bytes;
use serialgate_protocol::{is_control_topic, topic_ids, TopicId};

use crate::bridge::{BridgeError, PublisherBridge, SubscriberBridge};

/// Control frames handled by the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    PublisherAdvertise,
    SubscriberAdvertise,
    TimeSync,
    DeviceLog,
}

impl ControlKind {
    pub fn topic_id(self) -> TopicId {
        match self {
            ControlKind::PublisherAdvertise => topic_ids::PUBLISHER,
            ControlKind::SubscriberAdvertise => topic_ids::SUBSCRIBER,
            ControlKind::TimeSync => topic_ids::TIME,
            ControlKind::DeviceLog => topic_ids::LOG,
        }
    }
}

pub enum Handler {
    Control(ControlKind),
    UserPublish(Box<dyn PublisherBridge>),
    UserSubscribe(Box<dyn SubscriberBridge>),
}

impl Handler {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Handler::Control(_) => "control",
            Handler::UserPublish(_) => "publish",
            Handler::UserSubscribe(_) => "subscribe",
        }
    }
}

/// Where a dispatched frame ended up.
#[derive(Debug)]
pub enum Route {
    /// Control frame; the payload is handed back to the session.
    Control(ControlKind, Bytes),
    /// Forwarded to the topic's publisher bridge.
    Forwarded,
    /// Frame on a topic the device subscribed to; nothing consumes it.
    DeviceBound,
    /// No handler registered for the id.
    Unknown,
}

pub struct TopicRegistry {
    handlers: HashMap<TopicId, Handler>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    /// Registry pre-populated with the built-in control handlers.
    pub fn new() -> Self {
        let mut handlers = HashMap::new();
        for kind in [
            ControlKind::PublisherAdvertise,
            ControlKind::SubscriberAdvertise,
            ControlKind::TimeSync,
            ControlKind::DeviceLog,
        ] {
            handlers.insert(kind.topic_id(), Handler::Control(kind));
        }
        Self { handlers }
    }

    /// Register a bridge for a user topic, returning the handler it replaced.
    pub fn register(
        &mut self,
        topic_id: TopicId,
        handler: Handler,
    ) -> Result<Option<Handler>, BridgeError> {
        if is_control_topic(topic_id) && !matches!(handler, Handler::Control(_)) {
            return Err(BridgeError::ReservedTopic(topic_id));
        }
        Ok(self.handlers.insert(topic_id, handler))
    }

    pub fn dispatch(&self, topic_id: TopicId, payload: Bytes) -> Result<Route, BridgeError> {
        match self.handlers.get(&topic_id) {
            Some(Handler::Control(kind)) => Ok(Route::Control(*kind, payload)),
            Some(Handler::UserPublish(bridge)) => {
                bridge.forward(payload)?;
                Ok(Route::Forwarded)
            }
            Some(Handler::UserSubscribe(_)) => Ok(Route::DeviceBound),
            None => Ok(Route::Unknown),
        }
    }

    pub fn get(&self, topic_id: TopicId) -> Option<&Handler> {
        self.handlers.get(&topic_id)
    }

    /// Number of live bridges (user topics).
    pub fn bridge_count(&self) -> usize {
        self.handlers
            .values()
            .filter(|h| !matches!(h, Handler::Control(_)))
            .count()
    }

    /// Drop every user-topic bridge, keeping the control handlers.
    pub fn clear_bridges(&mut self) -> usize {
        let before = self.handlers.len();
        self.handlers.retain(|_, h| matches!(h, Handler::Control(_)));
        before - self.handlers.len()
    }
}
