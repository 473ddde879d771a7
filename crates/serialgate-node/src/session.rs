//! Gateway session -- one device connection, one task.
//!
//! The session task owns the transport, the frame codec, the topic registry
//! and the sync watchdog. Everything that mutates protocol state runs inside
//! [`Session::run`]; other tasks reach the device only by sending an
//! [`OutboundRequest`] through a [`SessionHandle`].
//!
//! Lifecycle:
//!   1. Start: request topics (VER1 framing) and arm the retry deadline.
//!   2. Frames: dispatch through the registry; control frames are handled
//!      here and extend the deadline to the steady-state interval.
//!   3. Deadline expiry: log sync loss, request topics again.
//!   4. Transport failure or shutdown: release bridges and return.
//!
//! Writes are appended to the `FramedWrite` buffer and flushed by their own
//! select branch. A device that stops draining its side therefore never
//! stalls reads or teardown; whatever is still buffered at exit is dropped.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use serialgate_protocol::codec::DEFAULT_RX_CAPACITY;
use serialgate_protocol::{
    is_control_topic, topic_ids, Direction, Frame, FrameCodec, LogLevel, LogRecord,
    OutboundFrame, ProtocolError, ProtocolVersion, ReaderStats, Time, TopicId, TopicInfo,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::{BridgeError, BridgeFactory, DeviceSink};
use crate::registry::{ControlKind, Handler, Route, TopicRegistry};
use crate::watchdog::{SyncWatchdog, DEFAULT_ATTEMPT_INTERVAL, DEFAULT_TIMEOUT_INTERVAL};

/// How long a graceful shutdown waits for TX_STOP to leave the buffer.
const TX_STOP_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline after confirmed liveness.
    pub timeout_interval: Duration,
    /// Deadline between discovery requests while the device is silent.
    pub attempt_interval: Duration,
    /// Largest body (payload + checksum) the receive buffer accepts.
    pub rx_buffer_bytes: usize,
    /// Pending device writes before senders wait.
    pub write_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_interval: DEFAULT_TIMEOUT_INTERVAL,
            attempt_interval: DEFAULT_ATTEMPT_INTERVAL,
            rx_buffer_bytes: DEFAULT_RX_CAPACITY,
            write_queue_depth: 64,
        }
    }
}

/// A device-bound message queued from outside the session task.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub topic_id: TopicId,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

/// Cloneable entry point for writing to the device from any task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<OutboundRequest>,
}

impl SessionHandle {
    pub async fn send(&self, topic_id: TopicId, payload: Bytes) -> Result<(), BridgeError> {
        self.sink(topic_id).send(payload).await
    }

    pub fn try_send(&self, topic_id: TopicId, payload: Bytes) -> Result<(), BridgeError> {
        self.sink(topic_id).try_send(payload)
    }

    /// Write callback bound to one topic id.
    pub fn sink(&self, topic_id: TopicId) -> DeviceSink {
        DeviceSink::new(topic_id, self.tx.clone())
    }

    /// True once the session task has ended.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    ConnectionClosed,
    ReadFailed(String),
    WriteFailed(String),
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Shutdown => "shutdown",
            ExitReason::ConnectionClosed => "connection closed",
            ExitReason::ReadFailed(_) => "read failed",
            ExitReason::WriteFailed(_) => "write failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub reader: ReaderStats,
    pub forwarded: u64,
    pub control_frames: u64,
    pub unrecognized: u64,
    pub handler_failures: u64,
    /// Frames encoded into the write buffer.
    pub frames_sent: u64,
    pub writes_aborted: u64,
    pub sync_attempts: u64,
    pub bridges_released: u64,
}

#[derive(Debug)]
pub struct SessionExit {
    pub reason: ExitReason,
    pub version: ProtocolVersion,
    pub stats: SessionStats,
}

pub struct Session<R, W> {
    reader: FramedRead<R, FrameCodec>,
    writer: FramedWrite<W, FrameCodec>,
    requests: mpsc::Receiver<OutboundRequest>,
    handle: SessionHandle,
    registry: TopicRegistry,
    watchdog: SyncWatchdog,
    factory: Arc<dyn BridgeFactory>,
    stats: SessionStats,
    firmware_mismatch_reported: bool,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: R,
        writer: W,
        config: SessionConfig,
        factory: Arc<dyn BridgeFactory>,
    ) -> Self {
        let (tx, requests) = mpsc::channel(config.write_queue_depth.max(1));
        Self {
            reader: FramedRead::new(reader, FrameCodec::with_rx_capacity(config.rx_buffer_bytes)),
            writer: FramedWrite::new(writer, FrameCodec::new()),
            requests,
            handle: SessionHandle { tx },
            registry: TopicRegistry::new(),
            watchdog: SyncWatchdog::new(config.attempt_interval, config.timeout_interval),
            factory,
            stats: SessionStats::default(),
            firmware_mismatch_reported: false,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Protocol version detected so far.
    pub fn version(&self) -> ProtocolVersion {
        self.reader.decoder().version()
    }

    /// Run until the transport fails or `shutdown` fires. Consumes the
    /// session; the transport and every bridge are released on return.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> SessionExit {
        tracing::info!("starting session");

        let reason = self.drive(&mut shutdown).await;

        self.stats.reader = self.reader.decoder().stats();
        self.stats.bridges_released = self.registry.clear_bridges() as u64;
        let version = self.version();

        match &reason {
            ExitReason::Shutdown => tracing::info!(%version, "ending session"),
            ExitReason::ConnectionClosed => {
                tracing::warn!(%version, "device closed connection, ending session")
            }
            ExitReason::ReadFailed(error) => {
                tracing::warn!(%version, %error, "stopping session due to read error")
            }
            ExitReason::WriteFailed(error) => {
                tracing::warn!(%version, %error, "stopping session due to write error")
            }
        }
        tracing::info!(
            frames = self.stats.reader.frames,
            forwarded = self.stats.forwarded,
            sent = self.stats.frames_sent,
            bad_checksum = self.stats.reader.bad_checksum,
            unrecognized = self.stats.unrecognized,
            sync_attempts = self.stats.sync_attempts,
            bridges = self.stats.bridges_released,
            "session stats"
        );

        SessionExit {
            reason,
            version,
            stats: self.stats,
        }
    }

    async fn drive(&mut self, shutdown: &mut broadcast::Receiver<()>) -> ExitReason {
        self.attempt_sync();

        loop {
            // New requests wait for the buffer to drain; that keeps the
            // backlog in the bounded request queue.
            let writing = !self.writer.write_buffer().is_empty();

            tokio::select! {
                biased;

                flushed = SinkExt::<OutboundFrame>::flush(&mut self.writer), if writing => {
                    if let Err(e) = flushed {
                        return ExitReason::WriteFailed(e.to_string());
                    }
                }
                _ = shutdown.recv() => {
                    self.send_tx_stop().await;
                    return ExitReason::Shutdown;
                }
                frame = self.reader.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame),
                    Some(Err(e)) => return ExitReason::ReadFailed(e.to_string()),
                    None => return ExitReason::ConnectionClosed,
                },
                Some(request) = self.requests.recv(), if !writing => {
                    let version = self.version();
                    self.queue_frame(request.topic_id, request.payload, version);
                }
                _ = self.watchdog.expired() => {
                    tracing::warn!("sync with device lost");
                    self.attempt_sync();
                }
            }
        }
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Route one decoded frame. Problems are logged and the frame dropped.
    fn handle_frame(&mut self, frame: Frame) {
        let Frame { topic_id, payload } = frame;
        tracing::debug!(topic_id, len = payload.len(), "dispatching frame");

        let outcome = match self.registry.dispatch(topic_id, payload) {
            Ok(Route::Control(kind, payload)) => {
                self.stats.control_frames += 1;
                self.handle_control(kind, payload)
            }
            Ok(Route::Forwarded) => {
                self.stats.forwarded += 1;
                Ok(())
            }
            Ok(Route::DeviceBound) => {
                tracing::warn!(topic_id, "device sent data on a topic it subscribed to");
                self.stats.unrecognized += 1;
                Ok(())
            }
            Ok(Route::Unknown) => {
                tracing::warn!(topic_id, "received message with unrecognized topic id");
                self.stats.unrecognized += 1;
                Ok(())
            }
            Err(e) => Err(SessionError::Bridge(e)),
        };

        if let Err(e) = outcome {
            self.report_handler_failure(topic_id, &e);
        }
    }

    fn report_handler_failure(&mut self, topic_id: TopicId, error: &SessionError) {
        self.stats.handler_failures += 1;
        if is_control_topic(topic_id) {
            tracing::error!(topic_id, %error, "failed to parse setup message from device");
            if !self.firmware_mismatch_reported {
                self.firmware_mismatch_reported = true;
                tracing::error!("device firmware may be from an incompatible protocol release");
            }
        } else {
            tracing::warn!(topic_id, %error, "failed to handle user message from device");
        }
    }

    fn handle_control(&mut self, kind: ControlKind, payload: Bytes) -> Result<(), SessionError> {
        match kind {
            ControlKind::PublisherAdvertise => self.setup_publisher(&payload),
            ControlKind::SubscriberAdvertise => self.setup_subscriber(&payload),
            ControlKind::TimeSync => self.handle_time(),
            ControlKind::DeviceLog => self.handle_log(&payload),
        }
    }

    fn setup_publisher(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if payload.is_empty() {
            // No advertisement attached; the device is just answering.
            tracing::debug!("empty publisher frame from device, treating as liveness");
            self.watchdog.arm_steady();
            return Ok(());
        }

        let info = TopicInfo::decode(payload)?;
        check_user_topic(&info)?;
        let bridge = self.factory.publisher(&info)?;
        let replaced = self
            .registry
            .register(info.topic_id, Handler::UserPublish(bridge))?;
        log_advertisement(Direction::Publish, &info, replaced.as_ref());

        self.watchdog.arm_steady();
        Ok(())
    }

    fn setup_subscriber(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let info = TopicInfo::decode(payload)?;
        check_user_topic(&info)?;
        let sink = self.handle.sink(info.topic_id);
        let bridge = self.factory.subscriber(&info, sink)?;
        let replaced = self
            .registry
            .register(info.topic_id, Handler::UserSubscribe(bridge))?;
        log_advertisement(Direction::Subscribe, &info, replaced.as_ref());

        self.watchdog.arm_steady();
        Ok(())
    }

    fn handle_time(&mut self) -> Result<(), SessionError> {
        let time = Time::now();
        let version = self.version();
        self.queue_frame(topic_ids::TIME, time.encode(), version);

        // A time request is the device's heartbeat.
        self.watchdog.arm_steady();
        Ok(())
    }

    fn handle_log(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let record = LogRecord::decode(payload)?;
        let msg = record.msg.as_str();
        match record.level {
            LogLevel::Debug => tracing::debug!(device_log = msg, "device"),
            LogLevel::Info => tracing::info!(device_log = msg, "device"),
            LogLevel::Warn => tracing::warn!(device_log = msg, "device"),
            LogLevel::Error | LogLevel::Fatal => tracing::error!(device_log = msg, "device"),
        }
        self.watchdog.arm_steady();
        Ok(())
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Encode one frame into the write buffer. An encoding failure aborts
    /// only this write.
    fn queue_frame(&mut self, topic_id: TopicId, payload: Bytes, version: ProtocolVersion) {
        let frame = OutboundFrame {
            topic_id,
            payload,
            version,
        };
        match Pin::new(&mut self.writer).start_send(frame) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                tracing::trace!(
                    topic_id,
                    buffered = self.writer.write_buffer().len(),
                    "frame queued"
                );
            }
            Err(e) => {
                tracing::warn!(topic_id, error = %e, "aborting write to device");
                self.stats.writes_aborted += 1;
            }
        }
    }

    fn attempt_sync(&mut self) {
        tracing::debug!("sending topic request to device");
        self.stats.sync_attempts += 1;
        // The dialect may be unknown or being re-probed: always VER1.
        self.queue_frame(topic_ids::PUBLISHER, Bytes::new(), ProtocolVersion::V1);
        self.watchdog.arm_retry();
    }

    async fn send_tx_stop(&mut self) {
        let version = self.version();
        if !version.is_known() {
            return;
        }
        self.queue_frame(topic_ids::TX_STOP, Bytes::new(), version);

        let flush = SinkExt::<OutboundFrame>::flush(&mut self.writer);
        match tokio::time::timeout(TX_STOP_FLUSH_TIMEOUT, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "could not send tx stop to device"),
            Err(_) => tracing::debug!("device is not draining writes, dropping tx stop"),
        }
    }
}

/// Advertisements may only name user topic ids. Checked before any bridge
/// exists, so a rejected one leaves the middleware untouched.
fn check_user_topic(info: &TopicInfo) -> Result<(), BridgeError> {
    if is_control_topic(info.topic_id) {
        return Err(BridgeError::ReservedTopic(info.topic_id));
    }
    Ok(())
}

fn log_advertisement(direction: Direction, info: &TopicInfo, replaced: Option<&Handler>) {
    tracing::info!(
        direction = direction.as_str(),
        topic_id = info.topic_id,
        topic = %info.topic_name,
        message_type = %info.message_type,
        replaced = replaced.map(Handler::kind_name),
        "device topic advertised"
    );
}
