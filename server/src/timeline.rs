//! The authoritative playback timeline.
//!
//! Rendering position is always `now - base_time - base_time_offset`.
//! Pauses and completed tracks accumulate into `base_time_offset`, so a
//! client can reconstruct the intended presentation time with a single
//! subtraction; no per-pause event log crosses the wire.

use std::sync::Arc;
use std::time::Instant;

use unison_proto::{Playlist, ReferenceClock, Track, DURATION_UNKNOWN, TRACK_PAST_END};

/// Monotonic system clock counting from construction.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceClock for SystemClock {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

pub struct Timeline {
    clock: Arc<dyn ReferenceClock>,
    playlist: Playlist,
    base_time: u64,
    base_time_offset: u64,
    last_pause: Option<u64>,
    paused: bool,
    stopped: bool,
    stream_start_delay: u64,
}

impl Timeline {
    pub fn new(clock: Arc<dyn ReferenceClock>, tracks: Vec<Track>, stream_start_delay: u64) -> Self {
        Self {
            clock,
            playlist: Playlist::new(tracks),
            base_time: 0,
            base_time_offset: 0,
            last_pause: None,
            paused: false,
            stopped: false,
            stream_start_delay,
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Starts playing `index` from position 0: anchors `base_time` at the
    /// current reference instant and clears the accumulated offset.
    pub fn start_track(&mut self, index: u64) {
        self.playlist.set_current_track(index);
        self.base_time = self.clock.now();
        self.base_time_offset = 0;
        tracing::debug!(index, base_time = self.base_time, "track started");
    }

    /// Moves to the next track, folding the outgoing track's duration plus
    /// the stream-start delay into `base_time_offset`. An unknown duration
    /// falls back to the observed rendering position at this instant.
    ///
    /// Returns the new current-track index.
    pub fn advance_track(&mut self) -> u64 {
        let outgoing = match self.playlist.current() {
            Some(track) if track.duration_known() => track.duration,
            _ => self.position(),
        };
        self.base_time_offset += outgoing + self.stream_start_delay;

        let next = self.playlist.current_track() + 1;
        self.playlist.set_current_track(next);
        tracing::debug!(
            next,
            base_time_offset = self.base_time_offset,
            "advanced to next track"
        );
        next
    }

    /// Marks the playlist as played out.
    pub fn mark_past_end(&mut self) {
        self.playlist.set_current_track(TRACK_PAST_END);
    }

    /// Returns true when the paused flag actually changed. Entering pause
    /// records the pause instant; leaving it folds the paused interval into
    /// `base_time_offset` so rendering position is preserved.
    pub fn set_paused(&mut self, paused: bool) -> bool {
        if self.paused == paused {
            return false;
        }
        self.paused = paused;

        if paused {
            self.last_pause = Some(self.clock.now());
        } else if let Some(pause_start) = self.last_pause.take() {
            self.base_time_offset += self.clock.now().saturating_sub(pause_start);
            tracing::debug!(
                base_time_offset = self.base_time_offset,
                "resumed, total paused time folded in"
            );
        }
        true
    }

    /// Quiesces or revives playback without touching `base_time`.
    pub fn set_stopped(&mut self, stopped: bool) -> bool {
        if self.stopped == stopped {
            return false;
        }
        self.stopped = stopped;
        true
    }

    /// Current rendering position of the current track, ns. Frozen while
    /// paused.
    pub fn position(&self) -> u64 {
        let now = match (self.paused, self.last_pause) {
            (true, Some(pause_start)) => pause_start,
            _ => self.clock.now(),
        };
        now.saturating_sub(self.base_time + self.base_time_offset)
    }

    /// Records a duration learned by probing, for tracks the playlist lists
    /// as unknown. Returns true when the entry changed.
    pub fn note_duration(&mut self, index: u64, duration: u64) -> bool {
        match self.playlist.track_mut(index) {
            Some(track) if track.duration == DURATION_UNKNOWN && duration != DURATION_UNKNOWN => {
                track.duration = duration;
                true
            }
            _ => false,
        }
    }

    pub fn base_time(&self) -> u64 {
        self.base_time
    }

    pub fn base_time_offset(&self) -> u64 {
        self.base_time_offset
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn stream_start_delay(&self) -> u64 {
        self.stream_start_delay
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn playlist_mut(&mut self) -> &mut Playlist {
        &mut self.playlist
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};

    use unison_proto::ReferenceClock;

    /// Clock advanced by hand, for deterministic timeline tests.
    pub struct ManualClock {
        now: AtomicU64,
    }

    impl ManualClock {
        pub fn new(start: u64) -> Self {
            Self {
                now: AtomicU64::new(start),
            }
        }

        pub fn advance(&self, delta: u64) {
            self.now.fetch_add(delta, Ordering::SeqCst);
        }
    }

    impl ReferenceClock for ManualClock {
        fn now(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;
    use unison_proto::SECOND;

    fn timeline(clock: Arc<ManualClock>, delay: u64) -> Timeline {
        Timeline::new(
            clock,
            vec![
                Track::new("http://media/a", 10 * SECOND),
                Track::new("http://media/b", 5 * SECOND),
                Track::new("http://media/live", DURATION_UNKNOWN),
            ],
            delay,
        )
    }

    #[test]
    fn start_track_anchors_base_time() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut tl = timeline(Arc::clone(&clock), 0);

        tl.start_track(0);
        assert_eq!(tl.base_time(), 1_000);
        assert_eq!(tl.base_time_offset(), 0);

        clock.advance(3 * SECOND);
        assert_eq!(tl.position(), 3 * SECOND);
    }

    #[test]
    fn pause_freezes_position_and_resume_preserves_it() {
        let clock = Arc::new(ManualClock::new(0));
        let mut tl = timeline(Arc::clone(&clock), 0);
        tl.start_track(0);

        clock.advance(3 * SECOND);
        let before = tl.position();
        assert!(tl.set_paused(true));

        clock.advance(2 * SECOND);
        assert_eq!(tl.position(), before, "position must freeze while paused");

        assert!(tl.set_paused(false));
        assert_eq!(tl.position(), before, "resume must not move the position");
        assert_eq!(tl.base_time_offset(), 2 * SECOND);
    }

    #[test]
    fn paused_duration_accumulates_exactly() {
        let clock = Arc::new(ManualClock::new(0));
        let mut tl = timeline(Arc::clone(&clock), 0);
        tl.start_track(0);

        tl.set_paused(true);
        clock.advance(7 * SECOND);
        tl.set_paused(false);

        tl.set_paused(true);
        clock.advance(SECOND);
        tl.set_paused(false);

        assert_eq!(tl.base_time_offset(), 8 * SECOND);
    }

    #[test]
    fn redundant_pause_calls_are_ignored() {
        let clock = Arc::new(ManualClock::new(0));
        let mut tl = timeline(Arc::clone(&clock), 0);
        tl.start_track(0);

        assert!(tl.set_paused(true));
        assert!(!tl.set_paused(true));
        clock.advance(SECOND);
        assert!(tl.set_paused(false));
        assert!(!tl.set_paused(false));
        assert_eq!(tl.base_time_offset(), SECOND);
    }

    #[test]
    fn advance_with_known_duration_adds_duration_and_delay() {
        let clock = Arc::new(ManualClock::new(0));
        let mut tl = timeline(Arc::clone(&clock), 250_000_000);
        tl.start_track(0);

        clock.advance(10 * SECOND);
        let next = tl.advance_track();

        assert_eq!(next, 1);
        assert_eq!(tl.base_time_offset(), 10 * SECOND + 250_000_000);
    }

    #[test]
    fn advance_with_unknown_duration_uses_observed_position() {
        let clock = Arc::new(ManualClock::new(0));
        let mut tl = timeline(Arc::clone(&clock), 0);
        tl.start_track(2); // the live track

        clock.advance(42 * SECOND);
        tl.advance_track();

        assert_eq!(tl.base_time_offset(), 42 * SECOND);
    }

    #[test]
    fn stop_does_not_touch_base_time() {
        let clock = Arc::new(ManualClock::new(500));
        let mut tl = timeline(Arc::clone(&clock), 0);
        tl.start_track(0);
        let base = tl.base_time();

        assert!(tl.set_stopped(true));
        assert!(tl.set_stopped(false));
        assert_eq!(tl.base_time(), base);
    }

    #[test]
    fn note_duration_only_fills_unknown_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let mut tl = timeline(clock, 0);

        assert!(tl.note_duration(2, 30 * SECOND));
        assert!(!tl.note_duration(2, 31 * SECOND), "known entries stay put");
        assert!(!tl.note_duration(0, 9 * SECOND));
        assert_eq!(tl.playlist().track(2).unwrap().duration, 30 * SECOND);
    }
}
