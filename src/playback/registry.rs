//! Session registry
//!
//! Maps session ids to loaded material and the player that drives it. The
//! map itself is read-mostly; playback state lives behind each player's own
//! lock so lookups never wait on a transition.

use std::collections::BTreeMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::player::{PlaybackState, SequencePlayer};
use super::sequence::Sequence;
use crate::error::SessionError;
use crate::midi::file::ParsedMidiFile;
use crate::tracker::Tracker;

/// What a session was loaded from
#[derive(Debug, Clone)]
pub enum SessionSource {
    MidiFile(Box<ParsedMidiFile>),
    Tracker(Box<Tracker>),
}

impl SessionSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MidiFile(_) => "midi",
            Self::Tracker(_) => "tracker",
        }
    }
}

pub struct SessionEntry {
    pub id: String,
    pub name: String,
    pub source: SessionSource,
    pub player: SequencePlayer,
    pub loaded_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn sequence(&self) -> &Arc<Sequence> {
        self.player.sequence()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub kind: &'static str,
    pub state: PlaybackState,
    pub event_count: usize,
    pub duration_ms: f64,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<String, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; an existing id is left untouched
    pub fn register(&self, entry: SessionEntry) -> Result<Arc<SessionEntry>, SessionError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&entry.id) {
            return Err(SessionError::DuplicateId(entry.id));
        }
        let entry = Arc::new(entry);
        sessions.insert(entry.id.clone(), Arc::clone(&entry));
        log::info!(
            "Registered session {} ({}, {} events)",
            entry.id,
            entry.name,
            entry.sequence().len()
        );
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().get(id).cloned()
    }

    /// Like `get`, but a missing id is an error
    pub fn require(&self, id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        self.get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn sequence(&self, id: &str) -> Option<Arc<Sequence>> {
        self.get(id).map(|e| Arc::clone(e.sequence()))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Every session with its current state, ordered by id
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let entries: Vec<_> = self.sessions.read().values().cloned().collect();
        entries
            .iter()
            .map(|e| SessionSummary {
                id: e.id.clone(),
                name: e.name.clone(),
                kind: e.source.kind(),
                state: e.player.state(),
                event_count: e.sequence().len(),
                duration_ms: e.sequence().duration_us() as f64 / 1000.0,
                loaded_at: e.loaded_at,
            })
            .collect()
    }

    /// Stop and drop a session
    pub fn remove(&self, id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        let entry = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.player.stop();
        log::info!("Removed session {}", id);
        Ok(entry)
    }

    /// Stop every playing session. Returns how many were playing.
    pub fn stop_all(&self) -> usize {
        let entries: Vec<_> = self.sessions.read().values().cloned().collect();
        entries
            .iter()
            .filter(|e| e.player.state() == PlaybackState::Playing)
            .map(|e| e.player.stop())
            .count()
    }
}
