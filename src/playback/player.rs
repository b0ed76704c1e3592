//! Sequence player: the state machine driving one session's scheduler

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::feed::{PlaybackFeed, PlaybackNotice};
use super::scheduler::{CancelReport, DispatchStats, Scheduler, SchedulerStatus};
use super::sequence::Sequence;
use crate::error::{PortError, ServerError, SessionError};
use crate::midi::{MidiGateway, ScheduledEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Playing,
    Stopped,
}

/// Snapshot of a session's playback
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub state: PlaybackState,
    /// Stopped with a remembered cursor
    pub paused: bool,
    pub cursor_ms: f64,
    pub duration_ms: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub dispatched: u64,
    pub late: u64,
    pub max_lateness_ms: f64,
    pub pending: usize,
    pub last_error: Option<String>,
}

struct PlayerInner {
    state: PlaybackState,
    /// Resume point after a pause
    cursor_us: u64,
    paused: bool,
    /// Events a pause left unsent, replayed on resume
    carry: Vec<ScheduledEvent>,
    scheduler: Option<Scheduler>,
    started_at: Option<DateTime<Utc>>,
    stats: DispatchStats,
    last_error: Option<String>,
}

/// Drives one session. Every transition happens under the state lock, and a
/// stop waits for the dispatch thread to drain before the lock is released,
/// so a following play cannot race the previous run's note off flush.
pub struct SequencePlayer {
    session_id: String,
    sequence: Arc<Sequence>,
    gateway: Arc<MidiGateway>,
    feed: PlaybackFeed,
    jitter_tolerance: Duration,
    inner: Mutex<PlayerInner>,
}

impl SequencePlayer {
    pub fn new(
        session_id: &str,
        sequence: Arc<Sequence>,
        gateway: Arc<MidiGateway>,
        feed: PlaybackFeed,
        jitter_tolerance: Duration,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            sequence,
            gateway,
            feed,
            jitter_tolerance,
            inner: Mutex::new(PlayerInner {
                state: PlaybackState::Idle,
                cursor_us: 0,
                paused: false,
                carry: Vec::new(),
                scheduler: None,
                started_at: None,
                stats: DispatchStats::default(),
                last_error: None,
            }),
        }
    }

    pub fn sequence(&self) -> &Arc<Sequence> {
        &self.sequence
    }

    /// Fold a scheduler that ended on its own back into player state
    fn reconcile(&self, inner: &mut PlayerInner) {
        let ended = match inner.scheduler.as_ref() {
            Some(scheduler) => !scheduler.is_running(),
            None => false,
        };
        if !ended {
            return;
        }
        let Some(scheduler) = inner.scheduler.take() else {
            return;
        };
        inner.stats = scheduler.stats();
        let CancelReport { status, .. } = scheduler.cancel();

        inner.state = PlaybackState::Stopped;
        inner.cursor_us = 0;
        inner.paused = false;
        inner.carry.clear();
        if let SchedulerStatus::Failed(e) = status {
            inner.last_error = Some(e.to_string());
        }
    }

    /// Start playback: from the remembered cursor after a pause, otherwise
    /// from the top. Playing an already playing session restarts it.
    pub fn play(&self) -> Result<SessionStatus, ServerError> {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);

        if !self.gateway.is_connected() {
            return Err(PortError::NotFound("no MIDI port connected".to_string()).into());
        }

        if let Some(scheduler) = inner.scheduler.take() {
            log::info!("Restarting playback of {}", self.session_id);
            scheduler.cancel();
            inner.cursor_us = 0;
            inner.paused = false;
            inner.carry.clear();
        }

        let carry = std::mem::take(&mut inner.carry);
        let (start_us, events) = if inner.paused {
            (inner.cursor_us, carry.as_slice())
        } else {
            (0, self.sequence.events())
        };
        log::info!(
            "Playing {} from {}ms ({} events)",
            self.session_id,
            start_us / 1000,
            events.len()
        );

        inner.scheduler = Some(Scheduler::start(
            &self.session_id,
            events,
            start_us,
            Arc::clone(&self.gateway),
            self.feed.clone(),
            self.jitter_tolerance,
        ));
        inner.state = PlaybackState::Playing;
        inner.cursor_us = start_us;
        inner.paused = false;
        inner.started_at = Some(Utc::now());
        inner.stats = DispatchStats::default();
        inner.last_error = None;

        Ok(self.snapshot(&inner))
    }

    /// Stop and remember where playback got to
    pub fn pause(&self) -> Result<SessionStatus, ServerError> {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);

        let Some(scheduler) = inner.scheduler.take() else {
            return Err(SessionError::InvalidTransition {
                id: self.session_id.clone(),
                reason: "session is not playing".to_string(),
            }
            .into());
        };

        inner.stats = scheduler.stats();
        let report = scheduler.cancel();
        inner.cursor_us = report.position_us.min(self.sequence.duration_us());
        inner.carry = report.unsent;
        inner.paused = true;
        inner.state = PlaybackState::Stopped;
        log::info!("Paused {} at {}ms", self.session_id, inner.cursor_us / 1000);

        self.feed.publish(PlaybackNotice::Stopped {
            session_id: self.session_id.clone(),
            paused: true,
            cursor_ms: inner.cursor_us as f64 / 1000.0,
        });
        Ok(self.snapshot(&inner))
    }

    /// Stop and rewind. Returns once every note the session started is off.
    pub fn stop(&self) -> SessionStatus {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);

        if let Some(scheduler) = inner.scheduler.take() {
            inner.stats = scheduler.stats();
            scheduler.cancel();
            log::info!("Stopped {}", self.session_id);
            self.feed.publish(PlaybackNotice::Stopped {
                session_id: self.session_id.clone(),
                paused: false,
                cursor_ms: 0.0,
            });
        }
        if inner.state == PlaybackState::Playing || inner.paused {
            inner.state = PlaybackState::Stopped;
        }
        inner.cursor_us = 0;
        inner.paused = false;
        inner.carry.clear();

        self.snapshot(&inner)
    }

    /// Merge live events into the running dispatch queue
    pub fn insert_events(&self, events: &[ScheduledEvent]) -> Result<usize, ServerError> {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);

        let inserted = inner
            .scheduler
            .as_ref()
            .map(|s| s.insert(events))
            .unwrap_or(0);
        if inserted == 0 && !events.is_empty() {
            return Err(SessionError::InvalidTransition {
                id: self.session_id.clone(),
                reason: "events can only be inserted while playing".to_string(),
            }
            .into());
        }
        log::debug!("Inserted {} events into {}", inserted, self.session_id);
        Ok(inserted)
    }

    pub fn state(&self) -> PlaybackState {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);
        inner.state
    }

    pub fn status(&self) -> SessionStatus {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);
        self.snapshot(&inner)
    }

    fn snapshot(&self, inner: &PlayerInner) -> SessionStatus {
        let (cursor_us, stats, pending) = match inner.scheduler.as_ref() {
            Some(s) => (
                s.position_us().min(self.sequence.duration_us()),
                s.stats(),
                s.pending(),
            ),
            None => (inner.cursor_us, inner.stats, inner.carry.len()),
        };

        SessionStatus {
            session_id: self.session_id.clone(),
            state: inner.state,
            paused: inner.paused,
            cursor_ms: cursor_us as f64 / 1000.0,
            duration_ms: self.sequence.duration_us() as f64 / 1000.0,
            started_at: inner.started_at,
            dispatched: stats.dispatched,
            late: stats.late,
            max_lateness_ms: stats.max_lateness_us as f64 / 1000.0,
            pending,
            last_error: inner.last_error.clone(),
        }
    }
}
