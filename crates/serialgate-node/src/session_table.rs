//! Session table -- owns every running session task.
//!
//! Sessions never remove themselves. Each runs as a task in a [`JoinSet`];
//! the owner reaps finished tasks with [`SessionTable::join_next`], which
//! drops the table entry and logs how the session ended.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::bridge::BridgeFactory;
use crate::session::{ExitReason, Session, SessionConfig, SessionExit, SessionHandle};

pub type ConnectionId = u64;

pub struct SessionTable {
    handles: HashMap<ConnectionId, SessionHandle>,
    tasks: JoinSet<(ConnectionId, SessionExit)>,
    next_id: ConnectionId,
    shutdown: broadcast::Sender<()>,
    config: SessionConfig,
    factory: Arc<dyn BridgeFactory>,
}

impl SessionTable {
    pub fn new(config: SessionConfig, factory: Arc<dyn BridgeFactory>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            handles: HashMap::new(),
            tasks: JoinSet::new(),
            next_id: 1,
            shutdown,
            config,
            factory,
        }
    }

    /// Start a session over `reader`/`writer`. `peer` only labels the logs.
    pub fn spawn<R, W>(&mut self, reader: R, writer: W, peer: &str) -> ConnectionId
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        let session = Session::new(reader, writer, self.config.clone(), self.factory.clone());
        self.handles.insert(id, session.handle());

        let shutdown = self.shutdown.subscribe();
        let span = tracing::info_span!("session", conn = id, peer = %peer);
        self.tasks
            .spawn(async move { (id, session.run(shutdown).await) }.instrument(span));

        tracing::info!(conn = id, peer, sessions = self.handles.len(), "session started");
        id
    }

    /// Wait for the next session to finish and forget it. Returns `None`
    /// when no session is running.
    pub async fn join_next(&mut self) -> Option<(ConnectionId, SessionExit)> {
        loop {
            match self.tasks.join_next().await? {
                Ok((id, exit)) => {
                    self.handles.remove(&id);
                    if exit.reason == ExitReason::Shutdown {
                        tracing::info!(
                            conn = id,
                            version = %exit.version,
                            remaining = self.handles.len(),
                            "session ended"
                        );
                    } else {
                        tracing::warn!(
                            conn = id,
                            reason = exit.reason.as_str(),
                            version = %exit.version,
                            remaining = self.handles.len(),
                            "session ended"
                        );
                    }
                    return Some((id, exit));
                }
                Err(e) => {
                    // The id is lost with the task; drop whichever handles
                    // no longer have a live session behind them.
                    tracing::error!(error = %e, "session task failed");
                    self.handles.retain(|_, handle| !handle.is_closed());
                }
            }
        }
    }

    pub fn handle(&self, id: ConnectionId) -> Option<SessionHandle> {
        self.handles.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every session to stop and wait for all of them.
    pub async fn shutdown_all(&mut self) -> Vec<(ConnectionId, SessionExit)> {
        if !self.handles.is_empty() {
            tracing::info!(sessions = self.handles.len(), "stopping all sessions");
        }
        let _ = self.shutdown.send(());

        let mut exits = Vec::new();
        while let Some(exit) = self.join_next().await {
            exits.push(exit);
        }
        exits
    }
}
