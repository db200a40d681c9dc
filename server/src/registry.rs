//! Client registry and record dispatcher.
//!
//! Sessions are keyed by an internal `Uuid`, not by the client-supplied id:
//! duplicate ids are not rejected, the registry retains all of them and
//! emits their join/leave events independently.
//!
//! Record fan-out is a `watch` channel carrying the latest published
//! version. Workers wake on a change, compare against the last version they
//! sent, and serialise the current record under the read half of the record
//! lock. Sessions are not required to observe intermediate versions, only to
//! eventually send the latest one.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch, RwLock};
use unison_proto::{ClientDescriptor, SyncRecord};
use uuid::Uuid;

/// Per-connection state held for the lifetime of a control session.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: String,
    pub config: HashMap<String, serde_json::Value>,
}

/// Events the server surfaces to its embedder.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientJoined {
        id: String,
        config: HashMap<String, serde_json::Value>,
    },
    ClientLeft {
        id: String,
    },
    /// The probe pipeline reached the end of the current track.
    EndOfStream {
        index: u64,
    },
    /// The last track finished; the current-track index is now past end.
    EndOfPlaylist,
}

pub struct Registry {
    sessions: DashMap<Uuid, ClientSession>,
    events: broadcast::Sender<ServerEvent>,
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            sessions: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Registers a session and emits `ClientJoined`. Returns the session key.
    pub fn join(&self, descriptor: ClientDescriptor) -> Uuid {
        let key = Uuid::new_v4();
        tracing::info!(id = %descriptor.id, session = %key, "client joined");
        self.sessions.insert(
            key,
            ClientSession {
                id: descriptor.id.clone(),
                config: descriptor.config.clone(),
            },
        );
        let _ = self.events.send(ServerEvent::ClientJoined {
            id: descriptor.id,
            config: descriptor.config,
        });
        key
    }

    /// Removes a session and emits `ClientLeft`.
    pub fn leave(&self, key: Uuid) {
        if let Some((_, session)) = self.sessions.remove(&key) {
            tracing::info!(id = %session.id, session = %key, "client left");
            let _ = self.events.send(ServerEvent::ClientLeft { id: session.id });
        }
    }

    /// Emits a non-session event (media driver progress).
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a control transport needs to serve sessions.
pub struct ControlShared {
    /// The latest published record. Writers are the publish path only;
    /// session workers take the read half for the duration of one encode.
    pub record: RwLock<Option<SyncRecord>>,
    /// Latest published version; cloned per worker for wake-ups.
    pub version: watch::Receiver<u64>,
    pub registry: Registry,
}
