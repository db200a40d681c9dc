//! Media driver: keeps a probe pipeline on the current track so the server
//! learns durations and observes end-of-stream authoritatively.
//!
//! The probe itself belongs to the embedding media library; this module only
//! fixes its contract and drives it. The probe decodes the track's URI into
//! null sinks, so the server "plays" the playlist without rendering.

use std::sync::Arc;

use tokio::sync::mpsc;
use unison_proto::Result;

use crate::registry::ServerEvent;
use crate::server::ServerInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Torn down, holding no resources.
    Quiesced,
    Paused,
    Playing,
}

/// What a probe reports back, delivered over an mpsc channel so the driver
/// never runs on the media library's threads.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    EndOfStream,
    Error(String),
}

/// Contract the embedding media library fulfils for the server side.
pub trait ProbePipeline: Send + Sync + 'static {
    fn set_uri(&self, uri: &str) -> Result<()>;
    fn set_base_time(&self, ns: u64);
    fn set_target(&self, target: ProbeTarget) -> Result<()>;
    /// Duration of the current track once known, ns.
    fn duration(&self) -> Option<u64>;
}

/// Probe that never learns anything and never ends. Lets the server run
/// without a media library; clients then advance on their own durations.
pub struct NullProbe;

impl ProbePipeline for NullProbe {
    fn set_uri(&self, _uri: &str) -> Result<()> {
        Ok(())
    }

    fn set_base_time(&self, _ns: u64) {}

    fn set_target(&self, _target: ProbeTarget) -> Result<()> {
        Ok(())
    }

    fn duration(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug)]
pub(crate) enum DriverCommand {
    /// Point the probe at the current track and match the timeline state.
    Retune,
    SetPaused(bool),
    SetStopped(bool),
    Shutdown,
}

pub(crate) struct MediaDriver<P> {
    probe: Arc<P>,
    inner: Arc<ServerInner>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    events: mpsc::UnboundedReceiver<ProbeEvent>,
    events_closed: bool,
}

impl<P: ProbePipeline> MediaDriver<P> {
    pub(crate) fn new(
        probe: Arc<P>,
        inner: Arc<ServerInner>,
        commands: mpsc::UnboundedReceiver<DriverCommand>,
        events: mpsc::UnboundedReceiver<ProbeEvent>,
    ) -> Self {
        Self {
            probe,
            inner,
            commands,
            events,
            events_closed: false,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(DriverCommand::Shutdown) => {
                        let _ = self.probe.set_target(ProbeTarget::Quiesced);
                        break;
                    }
                    Some(DriverCommand::Retune) => self.retune().await,
                    Some(DriverCommand::SetPaused(paused)) => self.apply_paused(paused),
                    Some(DriverCommand::SetStopped(stopped)) => self.apply_stopped(stopped).await,
                },
                event = self.events.recv(), if !self.events_closed => match event {
                    None => self.events_closed = true,
                    Some(ProbeEvent::EndOfStream) => self.handle_eos().await,
                    Some(ProbeEvent::Error(message)) => {
                        tracing::error!(%message, "probe pipeline error, quiescing");
                        let _ = self.probe.set_target(ProbeTarget::Quiesced);
                    }
                },
            }
        }
    }

    async fn retune(&self) {
        let (uri, index, stopped, paused, render_base) = {
            let tl = self.inner.timeline.lock();
            (
                tl.playlist().current().map(|t| t.uri.clone()),
                tl.playlist().current_track(),
                tl.stopped(),
                tl.paused(),
                tl.base_time() + tl.base_time_offset(),
            )
        };

        let Some(uri) = uri else {
            // Past the end or an empty playlist: nothing to probe.
            let _ = self.probe.set_target(ProbeTarget::Quiesced);
            return;
        };

        if let Err(e) = self.probe.set_uri(&uri) {
            tracing::error!(%uri, error = %e, "probe rejected uri");
            return;
        }

        let target = if stopped {
            ProbeTarget::Quiesced
        } else if paused {
            ProbeTarget::Paused
        } else {
            // Align the probe's own rendering with what clients will present.
            self.probe.set_base_time(render_base);
            ProbeTarget::Playing
        };
        if let Err(e) = self.probe.set_target(target) {
            tracing::error!(?target, error = %e, "probe state change failed");
            return;
        }

        // If the probe already knows a duration the playlist lacks, record
        // it so clients can advance speculatively.
        if let Some(duration) = self.probe.duration() {
            let changed = {
                let mut tl = self.inner.timeline.lock();
                tl.note_duration(index, duration)
            };
            if changed {
                tracing::debug!(index, duration, "probed track duration");
                self.inner.publish().await;
            }
        }
    }

    fn apply_paused(&self, paused: bool) {
        if paused {
            if let Err(e) = self.probe.set_target(ProbeTarget::Paused) {
                tracing::error!(error = %e, "could not pause probe");
            }
            return;
        }

        // The resume already folded the paused interval into the offset;
        // re-read it so the probe renders in step with the clients.
        let render_base = {
            let tl = self.inner.timeline.lock();
            tl.base_time() + tl.base_time_offset()
        };
        self.probe.set_base_time(render_base);
        if let Err(e) = self.probe.set_target(ProbeTarget::Playing) {
            tracing::error!(error = %e, "could not resume probe");
        }
    }

    async fn apply_stopped(&self, stopped: bool) {
        if stopped {
            if let Err(e) = self.probe.set_target(ProbeTarget::Quiesced) {
                tracing::error!(error = %e, "could not quiesce probe");
            }
        } else {
            self.retune().await;
        }
    }

    async fn handle_eos(&self) {
        let _ = self.probe.set_target(ProbeTarget::Quiesced);

        let (index, on_last) = {
            let tl = self.inner.timeline.lock();
            (tl.playlist().current_track(), tl.playlist().on_last_track())
        };
        self.inner.registry().emit(ServerEvent::EndOfStream { index });
        tracing::info!(index, "end of stream");

        if on_last {
            {
                let mut tl = self.inner.timeline.lock();
                tl.mark_past_end();
            }
            self.inner.publish().await;
            self.inner.registry().emit(ServerEvent::EndOfPlaylist);
            tracing::info!("end of playlist");
        } else {
            {
                let mut tl = self.inner.timeline.lock();
                tl.advance_track();
            }
            self.inner.publish().await;
            self.retune().await;
        }
    }
}
