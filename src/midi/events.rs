//! MIDI event types and their wire encoding
//!
//! `MidiEvent` is a single channel voice message. `ScheduledEvent` pins one to
//! an offset from the start of a sequence.

use serde::{Deserialize, Serialize};
use std::ops::Deref;

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;
pub const PITCH_BEND: u8 = 0xE0;

/// CC 123: all notes off (channel mode message)
pub const CC_ALL_NOTES_OFF: u8 = 123;

/// MIDI channel voice messages the server can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MidiEvent {
    /// Note on event
    NoteOn {
        /// MIDI channel (0-15)
        channel: u8,
        /// MIDI note number (0-127)
        note: u8,
        /// Velocity (0-127)
        velocity: u8,
    },
    /// Note off event
    NoteOff {
        /// MIDI channel (0-15)
        channel: u8,
        /// MIDI note number (0-127)
        note: u8,
        /// Release velocity (0-127, often ignored)
        #[serde(default)]
        velocity: u8,
    },
    /// Control change (CC) event
    ControlChange {
        channel: u8,
        controller: u8,
        value: u8,
    },
    /// Program change event
    ProgramChange { channel: u8, program: u8 },
    /// Pitch bend event
    PitchBend {
        channel: u8,
        /// 14-bit pitch bend value (0-16383, center at 8192)
        value: u16,
    },
}

impl MidiEvent {
    #[inline]
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::NoteOn {
            channel,
            note,
            velocity,
        }
    }

    #[inline]
    pub fn note_off(channel: u8, note: u8) -> Self {
        Self::NoteOff {
            channel,
            note,
            velocity: 0,
        }
    }

    #[inline]
    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::ControlChange {
            channel,
            controller,
            value,
        }
    }

    #[inline]
    pub fn program_change(channel: u8, program: u8) -> Self {
        Self::ProgramChange { channel, program }
    }

    #[inline]
    pub fn pitch_bend(channel: u8, value: u16) -> Self {
        Self::PitchBend { channel, value }
    }

    pub fn channel(&self) -> u8 {
        match *self {
            Self::NoteOn { channel, .. }
            | Self::NoteOff { channel, .. }
            | Self::ControlChange { channel, .. }
            | Self::ProgramChange { channel, .. }
            | Self::PitchBend { channel, .. } => channel,
        }
    }

    /// Ordering rank among events sharing a timestamp.
    ///
    /// Note offs go first so a retriggered note is never swallowed, then
    /// program/controller changes so they apply to the notes that follow.
    pub fn tie_rank(&self) -> u8 {
        match self {
            Self::NoteOff { .. } => 0,
            Self::ProgramChange { .. } | Self::ControlChange { .. } | Self::PitchBend { .. } => 1,
            Self::NoteOn { .. } => 2,
        }
    }

    /// Encode as raw MIDI bytes
    pub fn to_bytes(&self) -> RawMessage {
        match *self {
            Self::NoteOn {
                channel,
                note,
                velocity,
            } => RawMessage::three(NOTE_ON | (channel & 0x0F), note & 0x7F, velocity & 0x7F),
            Self::NoteOff {
                channel,
                note,
                velocity,
            } => RawMessage::three(NOTE_OFF | (channel & 0x0F), note & 0x7F, velocity & 0x7F),
            Self::ControlChange {
                channel,
                controller,
                value,
            } => RawMessage::three(
                CONTROL_CHANGE | (channel & 0x0F),
                controller & 0x7F,
                value & 0x7F,
            ),
            Self::ProgramChange { channel, program } => {
                RawMessage::two(PROGRAM_CHANGE | (channel & 0x0F), program & 0x7F)
            }
            Self::PitchBend { channel, value } => {
                let value = value.min(0x3FFF);
                RawMessage::three(
                    PITCH_BEND | (channel & 0x0F),
                    (value & 0x7F) as u8,
                    (value >> 7) as u8,
                )
            }
        }
    }

    /// Decode raw MIDI bytes. Note on with velocity 0 decodes as note off.
    pub fn from_bytes(message: &[u8]) -> Option<Self> {
        let status = *message.first()?;
        let channel = status & 0x0F;
        let data = |i: usize| message.get(i).map(|b| b & 0x7F);

        match status & 0xF0 {
            NOTE_OFF => Some(Self::NoteOff {
                channel,
                note: data(1)?,
                velocity: data(2)?,
            }),
            NOTE_ON => {
                let note = data(1)?;
                let velocity = data(2)?;
                if velocity == 0 {
                    Some(Self::note_off(channel, note))
                } else {
                    Some(Self::note_on(channel, note, velocity))
                }
            }
            CONTROL_CHANGE => Some(Self::control_change(channel, data(1)?, data(2)?)),
            PROGRAM_CHANGE => Some(Self::program_change(channel, data(1)?)),
            PITCH_BEND => {
                let lsb = data(1)? as u16;
                let msb = data(2)? as u16;
                Some(Self::pitch_bend(channel, (msb << 7) | lsb))
            }
            _ => None,
        }
    }
}

/// Encoded MIDI message, at most three bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage {
    bytes: [u8; 3],
    len: usize,
}

impl RawMessage {
    fn two(status: u8, a: u8) -> Self {
        Self {
            bytes: [status, a, 0],
            len: 2,
        }
    }

    fn three(status: u8, a: u8, b: u8) -> Self {
        Self {
            bytes: [status, a, b],
            len: 3,
        }
    }
}

impl Deref for RawMessage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// A MIDI event pinned to an offset (microseconds) from sequence start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEvent {
    pub offset_us: u64,
    #[serde(flatten)]
    pub event: MidiEvent,
}

impl ScheduledEvent {
    pub fn new(offset_us: u64, event: MidiEvent) -> Self {
        Self { offset_us, event }
    }
}
