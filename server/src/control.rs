//! Control-channel server.
//!
//! The transport is pluggable: anything that can accept sessions, deliver
//! the current record and push updates can stand in for the default framed
//! TCP listener. A session worker's life is: read one join descriptor, send
//! the current record, then forward every newer record until the peer goes
//! away. The join contract allows no further client-to-server traffic, so
//! any inbound byte after the descriptor ends the session.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use unison_proto::{ClientDescriptor, Error, FrameReader, Result};

use crate::registry::ControlShared;

/// Capability set a control transport implements. No inheritance; the TCP
/// default and any alternative satisfy the same three operations.
#[allow(async_fn_in_trait)]
pub trait ControlServer: Send + Sync + 'static {
    async fn start(&self, shared: Arc<ControlShared>) -> Result<()>;
    async fn stop(&self);
    /// Bound address once started. Useful when listening on port 0.
    fn local_addr(&self) -> Option<SocketAddr>;
}

struct Running {
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

/// Default transport: framed JSON over TCP.
pub struct TcpControlServer {
    address: String,
    port: u16,
    bound: Mutex<Option<SocketAddr>>,
    running: Mutex<Option<Running>>,
}

impl TcpControlServer {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            bound: Mutex::new(None),
            running: Mutex::new(None),
        }
    }
}

impl ControlServer for TcpControlServer {
    async fn start(&self, shared: Arc<ControlShared>) -> Result<()> {
        let listener = TcpListener::bind((self.address.as_str(), self.port)).await?;
        let local = listener.local_addr()?;
        *self.bound.lock() = Some(local);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(listener, shared, shutdown_rx));
        *self.running.lock() = Some(Running {
            shutdown: shutdown_tx,
            accept,
        });

        tracing::info!(%local, "control server listening");
        Ok(())
    }

    async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            let _ = running.accept.await;
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ControlShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_session(
                        stream,
                        peer,
                        Arc::clone(&shared),
                        shutdown.clone(),
                    ));
                }
                Err(e) => tracing::warn!("accept failed: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_session(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ControlShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(%peer, "control connection accepted");
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new(read_half);

    let descriptor: ClientDescriptor = match frames.read_frame().await {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => {
            tracing::debug!(%peer, "closed before sending a join descriptor");
            return;
        }
        Err(e) => {
            tracing::warn!(%peer, error = %e, "unreadable join descriptor");
            return;
        }
    };
    if frames.has_pending() {
        tracing::warn!(%peer, "unexpected data after join descriptor, closing");
        return;
    }

    // Clone the wake-up channel before the initial send so a publish racing
    // the join is not missed.
    let mut version_rx = shared.version.clone();
    let key = shared.registry.join(descriptor);

    let mut last_sent = 0u64;
    if let Err(e) = send_current(&shared, &mut write_half, &mut last_sent).await {
        tracing::warn!(%peer, error = %e, "could not deliver initial record");
        shared.registry.leave(key);
        return;
    }

    let (mut read_half, _residue) = frames.into_inner();

    loop {
        tokio::select! {
            changed = version_rx.changed() => {
                if changed.is_err() {
                    break; // publisher dropped, server is going away
                }
                if let Err(e) = send_current(&shared, &mut write_half, &mut last_sent).await {
                    tracing::warn!(%peer, error = %e, "record delivery failed");
                    break;
                }
            }
            inbound = probe_socket(&mut read_half) => {
                match inbound {
                    SocketStatus::Closed => tracing::debug!(%peer, "peer closed"),
                    SocketStatus::UnexpectedData => {
                        tracing::warn!(%peer, "client sent data after joining, closing session");
                    }
                    SocketStatus::Failed(e) => tracing::warn!(%peer, error = %e, "socket error"),
                }
                break;
            }
            _ = shutdown.changed() => break,
        }
    }

    shared.registry.leave(key);
}

enum SocketStatus {
    Closed,
    UnexpectedData,
    Failed(std::io::Error),
}

async fn probe_socket(read_half: &mut OwnedReadHalf) -> SocketStatus {
    let mut buf = [0u8; 64];
    match read_half.read(&mut buf).await {
        Ok(0) => SocketStatus::Closed,
        Ok(_) => SocketStatus::UnexpectedData,
        Err(e) => SocketStatus::Failed(e),
    }
}

/// Sends the current record if it is newer than the last one this session
/// saw. Encoding happens under the read lock; the write does not.
async fn send_current(
    shared: &ControlShared,
    writer: &mut OwnedWriteHalf,
    last_sent: &mut u64,
) -> Result<()> {
    let payload = {
        let guard = shared.record.read().await;
        match guard.as_ref() {
            Some(record) if record.version > *last_sent => {
                *last_sent = record.version;
                serde_json::to_vec(record).map_err(|e| Error::Decode(e.to_string()))?
            }
            _ => return Ok(()),
        }
    };
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
