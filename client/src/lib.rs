//! Client side of the Unison playback sync service.
//!
//! A client joins the server's control channel, disciplines its local clock
//! to the server's, and drives a local playback pipeline so its rendering
//! matches every peer's to within the seek tolerance.

pub mod control;
pub mod engine;
pub mod pipeline;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use unison_proto::{ClientDescriptor, Error, Result};

pub use control::{ControlClient, ControlEvent, TcpControlClient};
pub use engine::{
    ClockFactory, Engine, EngineHandle, EngineInput, SeekState, CLOCK_SYNC_TIMEOUT, SEEK_TOLERANCE,
};
pub use pipeline::{
    BusEvent, BusHandler, LocalClock, NullPipeline, PipelineTarget, PlaybackPipeline, StateChange,
};
pub use transform::TransformStep;

pub struct ClientConfig {
    pub server_address: String,
    pub server_port: u16,
    /// How this client identifies itself; also the key the server uses to
    /// address per-client transforms. Uniqueness is not enforced.
    pub id: String,
    pub config: HashMap<String, serde_json::Value>,
}

struct Started {
    engine: EngineHandle,
    engine_task: JoinHandle<()>,
    pump: JoinHandle<()>,
}

/// Wires the control client to the catch-up engine.
pub struct SyncClient<C = TcpControlClient> {
    control: C,
    descriptor: ClientDescriptor,
    pipeline: Arc<dyn PlaybackPipeline>,
    clock_factory: Mutex<Option<ClockFactory>>,
    started: Mutex<Option<Started>>,
}

impl SyncClient<TcpControlClient> {
    pub fn new(
        config: ClientConfig,
        pipeline: Arc<dyn PlaybackPipeline>,
        clock_factory: ClockFactory,
    ) -> Self {
        let control = TcpControlClient::new(config.server_address.clone(), config.server_port);
        Self::with_control(config, pipeline, clock_factory, control)
    }
}

impl<C: ControlClient> SyncClient<C> {
    pub fn with_control(
        config: ClientConfig,
        pipeline: Arc<dyn PlaybackPipeline>,
        clock_factory: ClockFactory,
        control: C,
    ) -> Self {
        let descriptor = ClientDescriptor {
            id: config.id,
            config: config.config,
        };
        Self {
            control,
            descriptor,
            pipeline,
            clock_factory: Mutex::new(Some(clock_factory)),
            started: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let clock_factory = self
            .clock_factory
            .lock()
            .take()
            .ok_or_else(|| Error::Config("client already started".to_string()))?;

        let events = self.control.start(&self.descriptor).await?;

        let (engine, handle) = Engine::new(
            self.descriptor.id.clone(),
            Arc::clone(&self.pipeline),
            clock_factory,
        );
        let engine_task = tokio::spawn(engine.run());

        let pump_handle = handle.clone();
        let pump = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                match event {
                    ControlEvent::Record(record) => pump_handle.submit_record(record),
                    ControlEvent::Closed(error) => {
                        pump_handle.notify_closed(error);
                        break;
                    }
                }
            }
        });

        *self.started.lock() = Some(Started {
            engine: handle,
            engine_task,
            pump,
        });
        Ok(())
    }

    pub async fn stop(&self) {
        self.control.stop().await;
        let started = self.started.lock().take();
        if let Some(started) = started {
            let _ = started.pump.await;
            started.engine.notify_closed(None);
            let _ = started.engine_task.await;
        }
    }

    /// Handle into the running engine, for inspection.
    pub fn engine(&self) -> Option<EngineHandle> {
        self.started.lock().as_ref().map(|s| s.engine.clone())
    }
}
