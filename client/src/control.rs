//! Control-channel client.
//!
//! Pluggable like the server side: anything that can deliver a descriptor
//! and then produce a stream of records will do. The default opens a TCP
//! connection, sends the join descriptor, and reads framed records until
//! the server goes away or the client stops.

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use unison_proto::{write_frame, ClientDescriptor, Error, FrameReader, Result, SyncRecord};

/// What the control session produces.
#[derive(Debug)]
pub enum ControlEvent {
    Record(SyncRecord),
    /// The session ended; `None` is an orderly close, `Some` surfaces the
    /// decode or transport failure that killed it.
    Closed(Option<Error>),
}

#[allow(async_fn_in_trait)]
pub trait ControlClient: Send + Sync + 'static {
    /// Connects, sends the descriptor and returns the record stream.
    async fn start(
        &self,
        descriptor: &ClientDescriptor,
    ) -> Result<mpsc::UnboundedReceiver<ControlEvent>>;
    async fn stop(&self);
}

struct Running {
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
}

pub struct TcpControlClient {
    address: String,
    port: u16,
    running: Mutex<Option<Running>>,
}

impl TcpControlClient {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            running: Mutex::new(None),
        }
    }
}

impl ControlClient for TcpControlClient {
    async fn start(
        &self,
        descriptor: &ClientDescriptor,
    ) -> Result<mpsc::UnboundedReceiver<ControlEvent>> {
        let stream = TcpStream::connect((self.address.as_str(), self.port)).await?;
        tracing::info!(address = %self.address, port = self.port, "connected to control server");

        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, descriptor).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(async move {
            // The write half stays open for the life of the session; the
            // server treats our half-close as a leave.
            let _write_half = write_half;
            let mut frames = FrameReader::new(read_half);
            loop {
                tokio::select! {
                    frame = frames.read_frame::<SyncRecord>() => match frame {
                        Ok(Some(record)) => {
                            if tx.send(ControlEvent::Record(record)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = tx.send(ControlEvent::Closed(None));
                            break;
                        }
                        Err(error) => {
                            let _ = tx.send(ControlEvent::Closed(Some(error)));
                            break;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        let _ = tx.send(ControlEvent::Closed(None));
                        break;
                    }
                }
            }
        });

        *self.running.lock() = Some(Running {
            shutdown: shutdown_tx,
            reader,
        });
        Ok(rx)
    }

    async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            let _ = running.reader.await;
        }
    }
}
