//! Flattened, time-ordered event lists ready for dispatch

use serde::Serialize;

use crate::midi::{MidiEvent, ScheduledEvent};

/// Time-stamped MIDI events sorted by offset.
///
/// Equal offsets keep declaration order, except that note offs come before
/// program/controller changes, which come before note ons.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Sequence {
    events: Vec<ScheduledEvent>,
}

impl Sequence {
    pub fn new(mut events: Vec<ScheduledEvent>) -> Self {
        // Stable: declaration order survives within a rank
        events.sort_by_key(|e| (e.offset_us, e.event.tie_rank()));
        Self { events }
    }

    pub fn events(&self) -> &[ScheduledEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Offset of the last event
    pub fn duration_us(&self) -> u64 {
        self.events.last().map(|e| e.offset_us).unwrap_or(0)
    }

    pub fn note_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.event, MidiEvent::NoteOn { velocity, .. } if velocity > 0))
            .count()
    }

    /// Distinct channels used, ascending
    pub fn channels(&self) -> Vec<u8> {
        let mut channels: Vec<u8> = self.events.iter().map(|e| e.event.channel()).collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }
}
