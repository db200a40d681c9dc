//! `SyncServer`: the facade tying the timeline, registry, control transport
//! and media driver together.
//!
//! The timeline is the single mutator of playback state; every mutation is
//! followed by a publish, which snapshots the timeline into a fresh
//! `SyncRecord` under the record write lock and wakes the session workers
//! through the version channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use unison_proto::{Error, ReferenceClock, Result, SyncRecord, Track, TransformSet};

use crate::control::{ControlServer, TcpControlServer};
use crate::media::{DriverCommand, MediaDriver, NullProbe, ProbeEvent, ProbePipeline};
use crate::registry::{ControlShared, Registry, ServerEvent};
use crate::timeline::Timeline;

/// 300 ms, the pipeline slack clients apply unless configured otherwise.
pub const DEFAULT_LATENCY: u64 = 300 * unison_proto::MSECOND;

pub struct ServerConfig {
    pub control_address: String,
    pub control_port: u16,
    /// Where the network time provider is reachable; advertised verbatim in
    /// every record. The provider itself belongs to the media library.
    pub clock_address: String,
    pub clock_port: u16,
    pub latency: u64,
    pub stream_start_delay: u64,
    pub tracks: Vec<Track>,
    pub transforms: HashMap<String, TransformSet>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_address: "0.0.0.0".to_string(),
            control_port: 0,
            clock_address: "127.0.0.1".to_string(),
            clock_port: 0,
            latency: DEFAULT_LATENCY,
            stream_start_delay: 0,
            tracks: Vec::new(),
            transforms: HashMap::new(),
        }
    }
}

pub(crate) struct ServerInner {
    pub(crate) timeline: Mutex<Timeline>,
    pub(crate) shared: Arc<ControlShared>,
    version_tx: watch::Sender<u64>,
    clock_address: String,
    clock_port: u16,
    latency: u64,
    transforms: Mutex<HashMap<String, TransformSet>>,
}

impl ServerInner {
    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Snapshots the timeline into a new record and wakes every session
    /// worker. The version is derived under the write lock, so concurrent
    /// publishes stay strictly increasing.
    pub(crate) async fn publish(&self) {
        let mut guard = self.shared.record.write().await;
        let version = guard.as_ref().map(|r| r.version).unwrap_or(0) + 1;
        let record = {
            let tl = self.timeline.lock();
            SyncRecord {
                version,
                clock_address: self.clock_address.clone(),
                clock_port: self.clock_port,
                playlist: tl.playlist().clone(),
                base_time: tl.base_time(),
                base_time_offset: tl.base_time_offset(),
                latency: self.latency,
                stream_start_delay: tl.stream_start_delay(),
                stopped: tl.stopped(),
                paused: tl.paused(),
                transforms: self.transforms.lock().clone(),
            }
        };
        *guard = Some(record);
        drop(guard);

        let _ = self.version_tx.send(version);
        tracing::debug!(version, "record published");
    }
}

pub struct SyncServer<C = TcpControlServer, P = NullProbe> {
    inner: Arc<ServerInner>,
    control: C,
    probe: Arc<P>,
    driver_tx: mpsc::UnboundedSender<DriverCommand>,
    driver_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverCommand>>>,
    probe_events: Mutex<Option<mpsc::UnboundedReceiver<ProbeEvent>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SyncServer<TcpControlServer, NullProbe> {
    /// Server with the default TCP transport and an inert probe.
    pub fn new(config: ServerConfig, clock: Arc<dyn ReferenceClock>) -> Self {
        let control = TcpControlServer::new(config.control_address.clone(), config.control_port);
        let (_probe_tx, probe_rx) = mpsc::unbounded_channel();
        Self::with_parts(config, clock, control, Arc::new(NullProbe), probe_rx)
    }
}

impl<C: ControlServer, P: ProbePipeline> SyncServer<C, P> {
    /// Fully pluggable constructor: any transport, any probe. `probe_events`
    /// is the channel the probe reports end-of-stream and errors on.
    pub fn with_parts(
        config: ServerConfig,
        clock: Arc<dyn ReferenceClock>,
        control: C,
        probe: Arc<P>,
        probe_events: mpsc::UnboundedReceiver<ProbeEvent>,
    ) -> Self {
        let (version_tx, version_rx) = watch::channel(0u64);
        let shared = Arc::new(ControlShared {
            record: RwLock::new(None),
            version: version_rx,
            registry: Registry::new(),
        });
        let inner = Arc::new(ServerInner {
            timeline: Mutex::new(Timeline::new(
                clock,
                config.tracks,
                config.stream_start_delay,
            )),
            shared,
            version_tx,
            clock_address: config.clock_address,
            clock_port: config.clock_port,
            latency: config.latency,
            transforms: Mutex::new(config.transforms),
        });
        let (driver_tx, driver_rx) = mpsc::unbounded_channel();

        Self {
            inner,
            control,
            probe,
            driver_tx,
            driver_rx: Mutex::new(Some(driver_rx)),
            probe_events: Mutex::new(Some(probe_events)),
            driver: Mutex::new(None),
        }
    }

    /// Starts playback of the first track and opens the control channel.
    pub async fn start(&self) -> Result<()> {
        {
            let mut tl = self.inner.timeline.lock();
            if tl.playlist().is_empty() {
                return Err(Error::Config("playlist is empty".to_string()));
            }
            tl.start_track(0);
        }
        self.inner.publish().await;

        self.control.start(Arc::clone(&self.inner.shared)).await?;

        let commands = self
            .driver_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Config("server already started".to_string()))?;
        let events = self
            .probe_events
            .lock()
            .take()
            .ok_or_else(|| Error::Config("server already started".to_string()))?;
        let driver = MediaDriver::new(
            Arc::clone(&self.probe),
            Arc::clone(&self.inner),
            commands,
            events,
        );
        *self.driver.lock() = Some(tokio::spawn(driver.run()));
        let _ = self.driver_tx.send(DriverCommand::Retune);

        Ok(())
    }

    /// Tears the service down. Not a playback state: use [`set_stopped`]
    /// to quiesce clients while keeping sessions alive.
    ///
    /// [`set_stopped`]: Self::set_stopped
    pub async fn stop(&self) {
        let _ = self.driver_tx.send(DriverCommand::Shutdown);
        self.control.stop().await;
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }

    pub async fn set_paused(&self, paused: bool) {
        let changed = {
            let mut tl = self.inner.timeline.lock();
            tl.set_paused(paused)
        };
        if !changed {
            return;
        }
        self.inner.publish().await;
        let _ = self.driver_tx.send(DriverCommand::SetPaused(paused));
    }

    pub async fn set_stopped(&self, stopped: bool) {
        let changed = {
            let mut tl = self.inner.timeline.lock();
            tl.set_stopped(stopped)
        };
        if !changed {
            return;
        }
        self.inner.publish().await;
        let _ = self.driver_tx.send(DriverCommand::SetStopped(stopped));
    }

    /// Replaces the track list. Entries other than the current track change
    /// without disturbing playback; use [`set_current_track`] to retune.
    ///
    /// [`set_current_track`]: Self::set_current_track
    pub async fn set_playlist(&self, tracks: Vec<Track>) {
        {
            let mut tl = self.inner.timeline.lock();
            tl.playlist_mut().set_tracks(tracks);
        }
        self.inner.publish().await;
    }

    /// Jumps to `index`, restarting the timeline at position 0 of that track.
    pub async fn set_current_track(&self, index: u64) {
        {
            let mut tl = self.inner.timeline.lock();
            tl.start_track(index);
        }
        self.inner.publish().await;
        let _ = self.driver_tx.send(DriverCommand::Retune);
    }

    /// Sets or clears the video transform for one client id.
    pub async fn set_transform(&self, client_id: &str, transform: Option<TransformSet>) {
        {
            let mut transforms = self.inner.transforms.lock();
            match transform {
                Some(t) => {
                    transforms.insert(client_id.to_string(), t);
                }
                None => {
                    transforms.remove(client_id);
                }
            }
        }
        self.inner.publish().await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.shared.registry.subscribe()
    }

    /// The record as currently published.
    pub async fn snapshot(&self) -> Option<SyncRecord> {
        self.inner.shared.record.read().await.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.inner.shared.registry.len()
    }
}
