use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel duration meaning "unknown" (live or unprobed tracks).
pub const DURATION_UNKNOWN: u64 = u64::MAX;

/// Sentinel current-track index meaning "played past the end".
pub const TRACK_PAST_END: u64 = u64::MAX;

/// One playlist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub uri: String,
    pub duration: u64,
}

impl Track {
    pub fn new(uri: impl Into<String>, duration: u64) -> Self {
        Self {
            uri: uri.into(),
            duration,
        }
    }

    pub fn duration_known(&self) -> bool {
        self.duration != DURATION_UNKNOWN
    }
}

/// Ordered track list plus the index currently being played.
///
/// On the wire this is a JSON tuple `[current-track, [{uri, duration}, ..]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PlaylistWire", into = "PlaylistWire")]
pub struct Playlist {
    current_track: u64,
    tracks: Vec<Track>,
}

#[derive(Serialize, Deserialize)]
struct PlaylistWire(u64, Vec<Track>);

impl From<PlaylistWire> for Playlist {
    fn from(wire: PlaylistWire) -> Self {
        Self {
            current_track: wire.0,
            tracks: wire.1,
        }
    }
}

impl From<Playlist> for PlaylistWire {
    fn from(playlist: Playlist) -> Self {
        PlaylistWire(playlist.current_track, playlist.tracks)
    }
}

impl Playlist {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            current_track: 0,
            tracks,
        }
    }

    pub fn current_track(&self) -> u64 {
        self.current_track
    }

    /// Sets the current-track index. `TRACK_PAST_END` marks the playlist as
    /// played out.
    pub fn set_current_track(&mut self, index: u64) {
        self.current_track = index;
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Replaces the track list. The current-track index is left alone;
    /// entries other than the current track can change freely without
    /// affecting ongoing playback.
    pub fn set_tracks(&mut self, tracks: Vec<Track>) {
        self.tracks = tracks;
    }

    pub fn track(&self, index: u64) -> Option<&Track> {
        if index == TRACK_PAST_END {
            return None;
        }
        self.tracks.get(index as usize)
    }

    pub fn track_mut(&mut self, index: u64) -> Option<&mut Track> {
        if index == TRACK_PAST_END {
            return None;
        }
        self.tracks.get_mut(index as usize)
    }

    pub fn current(&self) -> Option<&Track> {
        self.track(self.current_track)
    }

    pub fn past_end(&self) -> bool {
        self.current_track == TRACK_PAST_END
    }

    /// True when the current track is the last one in the list.
    pub fn on_last_track(&self) -> bool {
        !self.past_end() && self.current_track as usize + 1 >= self.tracks.len()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Per-client video transform stages, all optional.
///
/// Applied in the fixed order crop, rotate, scale, box. The box stage is
/// derived from `offset`: insets are negated, and a negative inset grows the
/// canvas, which is what produces letterboxing/pillarboxing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<Crop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate: Option<Rotate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Scale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<Offset>,
}

impl TransformSet {
    pub fn is_empty(&self) -> bool {
        self.crop.is_none() && self.rotate.is_none() && self.scale.is_none() && self.offset.is_none()
    }
}

/// Pixels trimmed from each edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    #[serde(default)]
    pub left: u32,
    #[serde(default)]
    pub right: u32,
    #[serde(default)]
    pub top: u32,
    #[serde(default)]
    pub bottom: u32,
}

/// Clockwise rotation; only quarter turns are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rotate {
    pub degrees: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scale {
    pub width: u32,
    pub height: u32,
}

/// Picture displacement within the output canvas, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    #[serde(default)]
    pub left: i32,
    #[serde(default)]
    pub top: i32,
}

/// The record the server publishes to every client. Its fields fully
/// describe the desired playback state; a client needs nothing else to
/// converge on the shared timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Bumped on every push; clients discard records that do not increase it.
    pub version: u64,
    #[serde(rename = "clock-address")]
    pub clock_address: String,
    #[serde(rename = "clock-port")]
    pub clock_port: u16,
    pub playlist: Playlist,
    /// Reference-clock instant at which the current track started, ns.
    #[serde(rename = "base-time")]
    pub base_time: u64,
    /// Nanoseconds accumulated by pauses and completed tracks.
    /// `base_time + base_time_offset` is the reference instant of rendering
    /// position 0 of the current track.
    #[serde(rename = "base-time-offset")]
    pub base_time_offset: u64,
    /// Pipeline slack each client must apply, ns.
    pub latency: u64,
    /// Gap inserted between consecutive tracks, ns.
    #[serde(rename = "stream-start-delay")]
    pub stream_start_delay: u64,
    pub stopped: bool,
    pub paused: bool,
    #[serde(
        rename = "transform",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub transforms: HashMap<String, TransformSet>,
}

impl SyncRecord {
    pub fn current_uri(&self) -> Option<&str> {
        self.playlist.current().map(|t| t.uri.as_str())
    }

    /// The transform stages addressed to one client, if any.
    pub fn transform_for(&self, client_id: &str) -> Option<&TransformSet> {
        self.transforms.get(client_id)
    }
}

/// What a client sends as its first and only message after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub id: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

impl ClientDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: HashMap::new(),
        }
    }
}
