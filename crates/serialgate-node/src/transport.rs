//! Byte-stream transports feeding the session table.
//!
//! TCP: every accepted socket is one session. Serial: the device node is
//! opened as a plain file, one handle for reading and one for writing. Line
//! settings (baud rate) are applied externally, e.g. with `stty`.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::bridge::BridgeFactory;
use crate::session::SessionConfig;
use crate::session_table::SessionTable;

/// Accept device connections until `shutdown` fires, then stop every
/// session and wait for them.
pub async fn serve_tcp(
    listener: TcpListener,
    config: SessionConfig,
    factory: Arc<dyn BridgeFactory>,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(listen = %local, "accepting device connections");

    let mut table = SessionTable::new(config, factory);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "set_nodelay failed");
                    }
                    let (reader, writer) = stream.into_split();
                    table.spawn(reader, writer, &peer.to_string());
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            Some(_) = table.join_next(), if !table.is_empty() => {}
            _ = shutdown.recv() => break,
        }
    }

    table.shutdown_all().await;
    tracing::info!(listen = %local, "tcp transport stopped");
    Ok(())
}

/// Open the serial device as a read handle and a write handle.
pub async fn open_serial(path: &Path) -> io::Result<(File, File)> {
    let reader = OpenOptions::new().read(true).open(path).await?;
    let writer = OpenOptions::new().write(true).open(path).await?;
    Ok((reader, writer))
}

/// Run one session on the serial device at a time. When it ends, or the
/// device cannot be opened, try again after `reconnect_delay`.
pub async fn serve_serial(
    path: &Path,
    reconnect_delay: Duration,
    config: SessionConfig,
    factory: Arc<dyn BridgeFactory>,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<()> {
    let device = path.display().to_string();
    let mut table = SessionTable::new(config, factory);

    loop {
        match open_serial(path).await {
            Ok((reader, writer)) => {
                tracing::info!(%device, "serial device opened");
                table.spawn(reader, writer, &device);
                tokio::select! {
                    _ = table.join_next() => {}
                    _ = shutdown.recv() => {
                        table.shutdown_all().await;
                        return Ok(());
                    }
                }
            }
            Err(e) => tracing::warn!(%device, error = %e, "cannot open serial device"),
        }

        tracing::info!(
            %device,
            delay_ms = reconnect_delay.as_millis() as u64,
            "reopening serial device after delay"
        );
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.recv() => return Ok(()),
        }
    }
}
