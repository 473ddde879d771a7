//! Serialgate Node -- gateway sessions bridging device byte streams to a
//! publish/subscribe middleware.
//!
//! One session owns one serial line or TCP socket. Frames from the device are
//! dispatched to control handlers or to topic bridges; middleware data flows
//! back to the device through the session's request channel.

pub mod bridge;
pub mod config;
pub mod local_bus;
pub mod registry;
pub mod session;
pub mod session_table;
pub mod transport;
pub mod watchdog;

use std::path::PathBuf;

pub use bridge::{BridgeError, BridgeFactory, DeviceSink, PublisherBridge, SubscriberBridge};
pub use session::{ExitReason, Session, SessionConfig, SessionExit, SessionHandle, SessionStats};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
