//! The catch-up engine.
//!
//! Given the shared reference time and the server's record, the engine
//! decides whether the freshly built pipeline should seek ahead or simply
//! anchor its base time, so rendering converges on the server's timeline
//! within the seek tolerance.
//!
//! The state machine is owned by one task; every cross-thread input arrives
//! as a message. The single exception is the seek-state word: the bus path
//! for `AsyncDone` runs synchronously on the pipeline's thread to read the
//! achieved seek position as early as possible, so `seek_state` is an
//! atomic it can inspect without taking any lock.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use unison_proto::{Error, ReferenceClock, SyncRecord, MSECOND};

use crate::pipeline::{BusEvent, PipelineTarget, PlaybackPipeline, StateChange};
use crate::transform::{steps_for, TransformStep};

/// Maximum drift tolerated without issuing a seek.
pub const SEEK_TOLERANCE: u64 = 200 * MSECOND;

/// Upper bound on waiting for the clock consumer to discipline itself.
pub const CLOCK_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the disciplined clock once the first record names the provider.
pub type ClockFactory = Box<dyn Fn(&str, u16) -> Arc<dyn ReferenceClock> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SeekState {
    NeedSeek = 0,
    InSeek = 1,
    DoneSeek = 2,
}

impl SeekState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SeekState::NeedSeek,
            1 => SeekState::InSeek,
            _ => SeekState::DoneSeek,
        }
    }
}

/// Inputs to the engine task.
#[derive(Debug)]
pub enum EngineInput {
    Record(SyncRecord),
    Bus(BusEvent),
    /// The control channel went away; `None` is an orderly close.
    ControlClosed(Option<Error>),
}

enum RecordOutcome {
    Ignored,
    /// Stored, but playback is gated until the clock disciplines.
    AwaitingClock,
    Applied,
}

struct EngineState {
    record: Option<SyncRecord>,
    clock: Option<Arc<dyn ReferenceClock>>,
    seek_offset: u64,
    /// Set after a pipeline error; the next record rebuilds from scratch.
    needs_rebuild: bool,
}

pub(crate) struct EngineShared {
    client_id: String,
    pipeline: Arc<dyn PlaybackPipeline>,
    clock_factory: ClockFactory,
    state: Mutex<EngineState>,
    seek_state: AtomicU8,
    synchronised: AtomicBool,
}

pub struct Engine {
    shared: Arc<EngineShared>,
    rx: mpsc::UnboundedReceiver<EngineInput>,
}

/// Cheap handle for feeding the engine and inspecting it.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineInput>,
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(
        client_id: impl Into<String>,
        pipeline: Arc<dyn PlaybackPipeline>,
        clock_factory: ClockFactory,
    ) -> (Engine, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(EngineShared {
            client_id: client_id.into(),
            pipeline: Arc::clone(&pipeline),
            clock_factory,
            state: Mutex::new(EngineState {
                record: None,
                clock: None,
                seek_offset: 0,
                needs_rebuild: false,
            }),
            seek_state: AtomicU8::new(SeekState::NeedSeek as u8),
            synchronised: AtomicBool::new(false),
        });

        let bus_shared = Arc::downgrade(&shared);
        let bus_tx = tx.clone();
        pipeline.set_bus_handler(Arc::new(move |event| {
            if matches!(event, BusEvent::AsyncDone) {
                // Synchronous on purpose: the achieved position is most
                // accurate right now, and anchoring early means correctly
                // synchronised buffers render sooner.
                if let Some(shared) = bus_shared.upgrade() {
                    shared.handle_async_done();
                }
            } else {
                let _ = bus_tx.send(EngineInput::Bus(event));
            }
        }));

        (
            Engine {
                shared: Arc::clone(&shared),
                rx,
            },
            EngineHandle { tx, shared },
        )
    }

    pub async fn run(mut self) {
        let mut clock_gate: Option<tokio::time::Instant> = None;

        loop {
            let input = match clock_gate {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                        Ok(input) => input,
                        Err(_) => {
                            tracing::error!(
                                "clock did not synchronise within {CLOCK_SYNC_TIMEOUT:?}, \
                                 playback held until the next record"
                            );
                            self.shared.synchronised.store(false, Ordering::SeqCst);
                            clock_gate = None;
                            continue;
                        }
                    }
                }
                None => self.rx.recv().await,
            };
            let Some(input) = input else { break };

            match input {
                EngineInput::Record(record) => {
                    if let RecordOutcome::AwaitingClock = self.shared.handle_record(record) {
                        clock_gate =
                            Some(tokio::time::Instant::now() + CLOCK_SYNC_TIMEOUT);
                    }
                }
                EngineInput::Bus(BusEvent::StateChanged { old, new }) => {
                    self.shared.handle_state_changed(old, new);
                }
                EngineInput::Bus(BusEvent::AsyncDone) => {
                    // Normally handled synchronously on the bus thread;
                    // harmless to repeat for transports that queue it.
                    self.shared.handle_async_done();
                }
                EngineInput::Bus(BusEvent::EndOfStream) => self.shared.handle_eos(),
                EngineInput::Bus(BusEvent::ClockSynchronised(ok)) => {
                    if self.shared.handle_clock_sync(ok) {
                        clock_gate = None;
                    }
                }
                EngineInput::Bus(BusEvent::Error(message)) => {
                    self.shared.handle_pipeline_error(&message);
                }
                EngineInput::ControlClosed(None) => {
                    tracing::info!("control channel closed, quiescing");
                    self.shared.pipeline.set_target(PipelineTarget::Null);
                    break;
                }
                EngineInput::ControlClosed(Some(error)) => {
                    tracing::error!(%error, "control channel failed, quiescing");
                    self.shared.pipeline.set_target(PipelineTarget::Null);
                    break;
                }
            }
        }
    }
}

impl EngineShared {
    /// Ingests a record. Stale versions are discarded; before the clock is
    /// disciplined records are absorbed without driving the pipeline past
    /// PAUSED.
    fn handle_record(&self, record: SyncRecord) -> RecordOutcome {
        let mut st = self.state.lock();

        if let Some(current) = &st.record {
            if record.version <= current.version {
                tracing::debug!(
                    version = record.version,
                    current = current.version,
                    "discarding out-of-order record"
                );
                return RecordOutcome::Ignored;
            }
        }

        if st.clock.is_none() {
            let clock = (self.clock_factory)(&record.clock_address, record.clock_port);
            self.pipeline.use_clock(Arc::clone(&clock));
            st.clock = Some(clock);
        }

        tracing::debug!(
            version = record.version,
            track = record.playlist.current_track(),
            stopped = record.stopped,
            paused = record.paused,
            "record received"
        );
        let old = st.record.replace(record);

        if !self.synchronised.load(Ordering::SeqCst) {
            return RecordOutcome::AwaitingClock;
        }

        match old {
            None => {
                drop(st);
                self.rebuild();
            }
            Some(old) => self.diff_apply(st, &old),
        }
        RecordOutcome::Applied
    }

    /// Applies the difference between the previous and the freshly stored
    /// record. Consumes the guard: pipeline calls happen unlocked.
    fn diff_apply(&self, mut st: parking_lot::MutexGuard<'_, EngineState>, old: &SyncRecord) {
        let new = st.record.clone().expect("record was just stored");

        let track_changed = old.playlist.current_track() != new.playlist.current_track()
            || old.current_uri() != new.current_uri();
        let transform_changed =
            old.transform_for(&self.client_id) != new.transform_for(&self.client_id);

        if new.stopped != old.stopped {
            drop(st);
            if new.stopped {
                tracing::info!("stopped by server");
                self.pipeline.set_target(PipelineTarget::Null);
            } else {
                self.rebuild();
            }
        } else if new.stopped {
            // Still stopped; nothing to drive.
            drop(st);
        } else if track_changed || new.base_time != old.base_time || st.needs_rebuild {
            // A new track or a new timeline origin is a discontinuity.
            st.needs_rebuild = false;
            drop(st);
            self.pipeline.set_target(PipelineTarget::Null);
            self.rebuild();
        } else if new.paused != old.paused {
            drop(st);
            if new.paused {
                self.pipeline.set_target(PipelineTarget::Paused);
            } else {
                self.anchor_base_time();
                self.pipeline.set_target(PipelineTarget::Playing);
            }
        } else if new.base_time_offset != old.base_time_offset {
            // Offset-only change (a pause elsewhere, a completed track with
            // the same uri): re-anchor without tearing down.
            drop(st);
            self.anchor_base_time();
        } else {
            drop(st);
        }

        if transform_changed && !new.stopped {
            self.pipeline
                .apply_transform(&self.current_transform_steps());
        }
    }

    /// Tears nothing down by itself: programs uri, latency and transforms,
    /// prerolls, then goes to playing unless the record says paused.
    /// Paused and playing are separate steps so the bus thread never races
    /// the seek-state reset.
    fn rebuild(&self) {
        let Some((uri, latency, paused, stopped)) = ({
            let mut st = self.state.lock();
            st.needs_rebuild = false;
            st.record.as_ref().map(|rec| {
                (
                    rec.current_uri().map(String::from),
                    rec.latency,
                    rec.paused,
                    rec.stopped,
                )
            })
        }) else {
            return;
        };

        if stopped {
            self.pipeline.set_target(PipelineTarget::Null);
            return;
        }
        let Some(uri) = uri else {
            // Played past the end; hold quiet until told otherwise.
            self.pipeline.set_target(PipelineTarget::Null);
            return;
        };

        self.pipeline.set_uri(&uri);
        self.pipeline.set_latency(latency);
        self.pipeline
            .apply_transform(&self.current_transform_steps());

        let live = match self.pipeline.set_target(PipelineTarget::Paused) {
            StateChange::NoPreroll => {
                tracing::debug!(%uri, "live pipeline detected");
                true
            }
            StateChange::Failed => {
                tracing::warn!(%uri, "could not preroll");
                false
            }
            StateChange::Ok => false,
        };

        {
            let mut st = self.state.lock();
            st.seek_offset = 0;
        }
        // Live sources are never seeked.
        self.set_seek_state(if live {
            SeekState::DoneSeek
        } else {
            SeekState::NeedSeek
        });

        if !paused {
            self.anchor_base_time();
            self.pipeline.set_target(PipelineTarget::Playing);
        }
    }

    /// The NEED_SEEK decision, taken when the pipeline comes up.
    fn handle_state_changed(&self, old: PipelineTarget, new: PipelineTarget) {
        if old != PipelineTarget::Paused && new != PipelineTarget::Playing {
            return;
        }
        if !self.synchronised.load(Ordering::SeqCst) {
            return;
        }
        if self
            .seek_state
            .compare_exchange(
                SeekState::NeedSeek as u8,
                SeekState::InSeek as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let current_position = {
            let st = self.state.lock();
            match (st.record.as_ref(), st.clock.as_ref()) {
                (Some(record), Some(clock)) => Some(
                    clock
                        .now()
                        .saturating_sub(record.base_time + record.base_time_offset),
                ),
                _ => None,
            }
        };
        let Some(current_position) = current_position else {
            self.set_seek_state(SeekState::DoneSeek);
            return;
        };

        if current_position > SEEK_TOLERANCE {
            // Seek ahead rather than let the sink clip everything between
            // here and the shared position.
            tracing::info!(position = current_position, "seeking to catch up");
            if !self.pipeline.seek(current_position) {
                tracing::warn!("seek refused, anchoring as-is");
                self.set_seek_state(SeekState::DoneSeek);
            }
            // Otherwise stay IN_SEEK until AsyncDone reports the landing
            // position.
        } else {
            tracing::debug!(
                position = current_position,
                "within tolerance, anchoring without seek"
            );
            {
                let mut st = self.state.lock();
                st.seek_offset = 0;
            }
            self.anchor_base_time();
            self.set_seek_state(SeekState::DoneSeek);
        }
    }

    /// Runs synchronously on the pipeline thread when a seek settles.
    pub(crate) fn handle_async_done(&self) {
        if self.seek_state.load(Ordering::SeqCst) != SeekState::InSeek as u8 {
            return;
        }
        if let Some(position) = self.pipeline.position() {
            {
                let mut st = self.state.lock();
                st.seek_offset = position;
            }
            tracing::debug!(seek_offset = position, "seek landed");
            self.anchor_base_time();
        }
        self.set_seek_state(SeekState::DoneSeek);
    }

    /// Local end of stream is advisory; the server's next record is what
    /// really advances the playlist. With both the outgoing and the next
    /// duration known the engine advances speculatively and lets the
    /// authoritative record confirm.
    fn handle_eos(&self) {
        self.pipeline.set_target(PipelineTarget::Null);

        let advanced = {
            let mut st = self.state.lock();
            let Some(record) = st.record.as_mut() else {
                return;
            };
            if record.playlist.past_end() {
                return;
            }
            let index = record.playlist.current_track();
            let outgoing = record.playlist.track(index).map(|t| t.duration);
            let upcoming = record.playlist.track(index + 1).map(|t| t.duration);
            match (outgoing, upcoming) {
                (Some(out), Some(next))
                    if out != unison_proto::DURATION_UNKNOWN
                        && next != unison_proto::DURATION_UNKNOWN =>
                {
                    record.base_time_offset += out + record.stream_start_delay;
                    record.playlist.set_current_track(index + 1);
                    true
                }
                _ => false,
            }
        };

        if advanced {
            tracing::info!("speculatively advancing to the next track");
            self.rebuild();
        } else {
            tracing::debug!("end of stream, waiting for the server");
        }
    }

    /// Returns true once playback may start.
    fn handle_clock_sync(&self, ok: bool) -> bool {
        if !ok {
            self.synchronised.store(false, Ordering::SeqCst);
            return false;
        }
        if self.synchronised.swap(true, Ordering::SeqCst) {
            return true;
        }

        let have_record = self.state.lock().record.is_some();
        if have_record {
            tracing::info!("clock synchronised, starting playback");
            self.rebuild();
        }
        true
    }

    fn handle_pipeline_error(&self, message: &str) {
        tracing::error!(%message, "pipeline error, forcing to null");
        self.pipeline.set_target(PipelineTarget::Null);
        self.state.lock().needs_rebuild = true;
        // No internal retry: the next record drives the rebuild.
    }

    /// Anchors the pipeline's base time at
    /// `base_time + base_time_offset + seek_offset`.
    fn anchor_base_time(&self) {
        let target = {
            let st = self.state.lock();
            let Some(record) = st.record.as_ref() else {
                return;
            };
            record.base_time + record.base_time_offset + st.seek_offset
        };
        self.pipeline.set_start_time_none();
        self.pipeline.set_base_time(target);
        tracing::debug!(base_time = target, "base time anchored");
    }

    fn current_transform_steps(&self) -> Vec<TransformStep> {
        let st = self.state.lock();
        st.record
            .as_ref()
            .map(|rec| steps_for(rec, &self.client_id))
            .unwrap_or_default()
    }

    fn set_seek_state(&self, state: SeekState) {
        self.seek_state.store(state as u8, Ordering::SeqCst);
    }
}

impl EngineHandle {
    pub fn submit_record(&self, record: SyncRecord) {
        let _ = self.tx.send(EngineInput::Record(record));
    }

    pub fn notify_closed(&self, error: Option<Error>) {
        let _ = self.tx.send(EngineInput::ControlClosed(error));
    }

    pub fn seek_state(&self) -> SeekState {
        SeekState::from_u8(self.shared.seek_state.load(Ordering::SeqCst))
    }

    pub fn synchronised(&self) -> bool {
        self.shared.synchronised.load(Ordering::SeqCst)
    }

    pub fn current_record(&self) -> Option<SyncRecord> {
        self.shared.state.lock().record.clone()
    }
}
