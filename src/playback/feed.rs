//! "Now playing" push stream
//!
//! Dispatch threads publish here; each subscribed connection holds a
//! broadcast receiver. Slow subscribers lose the oldest notices rather than
//! holding up playback.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::midi::MidiEvent;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PlaybackNotice {
    /// One dispatched event
    #[serde(rename_all = "camelCase")]
    Event {
        session_id: String,
        offset_ms: f64,
        late_ms: f64,
        event: MidiEvent,
    },
    /// Sequence played to the end
    #[serde(rename_all = "camelCase")]
    Finished { session_id: String },
    /// Stopped or paused by a client
    #[serde(rename_all = "camelCase")]
    Stopped {
        session_id: String,
        paused: bool,
        cursor_ms: f64,
    },
    /// Aborted by a port failure
    #[serde(rename_all = "camelCase")]
    Failed { session_id: String, error: String },
}

impl PlaybackNotice {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Event { session_id, .. }
            | Self::Finished { session_id }
            | Self::Stopped { session_id, .. }
            | Self::Failed { session_id, .. } => session_id,
        }
    }
}

#[derive(Clone)]
pub struct PlaybackFeed {
    sender: broadcast::Sender<PlaybackNotice>,
}

impl PlaybackFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackNotice> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; a no-op when nobody listens
    pub fn publish(&self, notice: PlaybackNotice) {
        let _ = self.sender.send(notice);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_subscribers() {
        let feed = PlaybackFeed::new(8);
        feed.publish(PlaybackNotice::Finished {
            session_id: "nobody".into(),
        });

        let mut rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        feed.publish(PlaybackNotice::Finished {
            session_id: "a".into(),
        });
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.session_id(), "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_notice_json_shape() {
        let notice = PlaybackNotice::Event {
            session_id: "s".into(),
            offset_ms: 125.0,
            late_ms: 0.2,
            event: MidiEvent::note_on(0, 60, 100),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["kind"], "event");
        assert_eq!(json["sessionId"], "s");
        assert_eq!(json["offsetMs"], 125.0);
        assert_eq!(json["event"]["type"], "note_on");
    }
}
