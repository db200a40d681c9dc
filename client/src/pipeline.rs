//! Contract for the local playback pipeline.
//!
//! The media library behind this trait is an external collaborator: it
//! decodes the track URI, renders against the disciplined clock and reports
//! progress over its bus. The catch-up engine only ever talks to this
//! surface, so anything from a GStreamer playbin wrapper to a test fake can
//! sit behind it.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use unison_proto::ReferenceClock;

use crate::transform::TransformStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineTarget {
    /// Torn down; no decoding, no rendering.
    Null,
    Paused,
    Playing,
}

/// Outcome of a state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Ok,
    /// The pipeline cannot preroll: a live source. Live pipelines are never
    /// seeked.
    NoPreroll,
    Failed,
}

/// Messages from the pipeline's bus.
///
/// All events are delivered on the pipeline's own threads through the
/// installed handler. `AsyncDone` in particular is delivered synchronously
/// at the moment the pipeline settles, because the achieved seek position
/// is read most accurately right then.
#[derive(Debug, Clone)]
pub enum BusEvent {
    StateChanged {
        old: PipelineTarget,
        new: PipelineTarget,
    },
    /// An asynchronous state change (seek or preroll) completed.
    AsyncDone,
    EndOfStream,
    /// The network clock consumer reporting its discipline state.
    ClockSynchronised(bool),
    Error(String),
}

pub type BusHandler = Arc<dyn Fn(BusEvent) + Send + Sync>;

pub trait PlaybackPipeline: Send + Sync + 'static {
    fn set_uri(&self, uri: &str);
    fn set_latency(&self, ns: u64);
    /// Slaves the pipeline to the disciplined reference clock.
    fn use_clock(&self, clock: Arc<dyn ReferenceClock>);
    /// Clears any fixed start time so an explicit base time takes effect.
    fn set_start_time_none(&self);
    fn set_base_time(&self, ns: u64);
    fn set_target(&self, target: PipelineTarget) -> StateChange;
    /// Accurate flushing seek to `position`. False when the pipeline cannot
    /// seek (the engine then anchors instead).
    fn seek(&self, position: u64) -> bool;
    /// Current playback position, once queryable.
    fn position(&self) -> Option<u64>;
    /// Installs, replaces or removes (empty slice) the video transform
    /// sub-pipeline ahead of the sink.
    fn apply_transform(&self, steps: &[TransformStep]);
    fn set_bus_handler(&self, handler: BusHandler);
}

/// Local monotonic clock for running without a network clock consumer.
/// Positions drift freely against the server; real deployments plug in the
/// media library's disciplined clock instead.
pub struct LocalClock {
    epoch: Instant,
}

impl LocalClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceClock for LocalClock {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Pipeline that renders nothing and accepts everything.
///
/// State changes succeed immediately and are reported through the bus
/// handler; the clock reports synchronised as soon as it is attached. Lets
/// the client binary run end to end without a media library.
pub struct NullPipeline {
    handler: Mutex<Option<BusHandler>>,
    target: Mutex<PipelineTarget>,
}

impl NullPipeline {
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
            target: Mutex::new(PipelineTarget::Null),
        }
    }

    fn emit(&self, event: BusEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

impl Default for NullPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackPipeline for NullPipeline {
    fn set_uri(&self, uri: &str) {
        tracing::debug!(%uri, "null pipeline: uri set");
    }

    fn set_latency(&self, _ns: u64) {}

    fn use_clock(&self, _clock: Arc<dyn ReferenceClock>) {
        self.emit(BusEvent::ClockSynchronised(true));
    }

    fn set_start_time_none(&self) {}

    fn set_base_time(&self, _ns: u64) {}

    fn set_target(&self, target: PipelineTarget) -> StateChange {
        let old = {
            let mut current = self.target.lock();
            std::mem::replace(&mut *current, target)
        };
        if old != target {
            self.emit(BusEvent::StateChanged { old, new: target });
        }
        StateChange::Ok
    }

    fn seek(&self, position: u64) -> bool {
        tracing::debug!(position, "null pipeline: seek");
        self.emit(BusEvent::AsyncDone);
        true
    }

    fn position(&self) -> Option<u64> {
        None
    }

    fn apply_transform(&self, steps: &[TransformStep]) {
        tracing::debug!(count = steps.len(), "null pipeline: transform applied");
    }

    fn set_bus_handler(&self, handler: BusHandler) {
        *self.handler.lock() = Some(handler);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Every pipeline call the engine makes, in order.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Uri(String),
        Latency(u64),
        StartTimeNone,
        BaseTime(u64),
        Target(PipelineTarget),
        Seek(u64),
        Transform(Vec<TransformStep>),
    }

    /// Scriptable pipeline double recording everything the engine does.
    pub struct FakePipeline {
        calls: Mutex<Vec<Call>>,
        handler: Mutex<Option<BusHandler>>,
        /// Result of the preroll (`set_target(Paused)`) step.
        pub preroll_result: Mutex<StateChange>,
        pub seek_succeeds: Mutex<bool>,
        /// What `position()` reports after a seek.
        pub landing_position: Mutex<Option<u64>>,
        /// Deliver AsyncDone synchronously from inside `seek`, the way a
        /// real pipeline's sync bus handler would.
        pub async_done_on_seek: Mutex<bool>,
    }

    impl FakePipeline {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                preroll_result: Mutex::new(StateChange::Ok),
                seek_succeeds: Mutex::new(true),
                landing_position: Mutex::new(None),
                async_done_on_seek: Mutex::new(true),
            })
        }

        pub fn emit(&self, event: BusEvent) {
            let handler = self.handler.lock().clone();
            if let Some(handler) = handler {
                handler(event);
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn clear_calls(&self) {
            self.calls.lock().clear();
        }

        pub fn targets(&self) -> Vec<PipelineTarget> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Target(target) => Some(target),
                    _ => None,
                })
                .collect()
        }

        pub fn last_base_time(&self) -> Option<u64> {
            self.calls()
                .into_iter()
                .rev()
                .find_map(|call| match call {
                    Call::BaseTime(ns) => Some(ns),
                    _ => None,
                })
        }

        pub fn seeks(&self) -> Vec<u64> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Seek(position) => Some(position),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: Call) {
            self.calls.lock().push(call);
        }
    }

    impl PlaybackPipeline for FakePipeline {
        fn set_uri(&self, uri: &str) {
            self.record(Call::Uri(uri.to_string()));
        }

        fn set_latency(&self, ns: u64) {
            self.record(Call::Latency(ns));
        }

        fn use_clock(&self, _clock: Arc<dyn ReferenceClock>) {}

        fn set_start_time_none(&self) {
            self.record(Call::StartTimeNone);
        }

        fn set_base_time(&self, ns: u64) {
            self.record(Call::BaseTime(ns));
        }

        fn set_target(&self, target: PipelineTarget) -> StateChange {
            self.record(Call::Target(target));
            if target == PipelineTarget::Paused {
                *self.preroll_result.lock()
            } else {
                StateChange::Ok
            }
        }

        fn seek(&self, position: u64) -> bool {
            self.record(Call::Seek(position));
            if !*self.seek_succeeds.lock() {
                return false;
            }
            if *self.async_done_on_seek.lock() {
                self.emit(BusEvent::AsyncDone);
            }
            true
        }

        fn position(&self) -> Option<u64> {
            *self.landing_position.lock()
        }

        fn apply_transform(&self, steps: &[TransformStep]) {
            self.record(Call::Transform(steps.to_vec()));
        }

        fn set_bus_handler(&self, handler: BusHandler) {
            *self.handler.lock() = Some(handler);
        }
    }
}
