//! Immediate control surface
//!
//! One-shot messages sent straight to the gateway outside any playback
//! session. Values arrive as plain integers from clients and are range
//! checked here, before anything touches the port.

use std::sync::Arc;

use crate::error::{ServerError, ValidationError};
use crate::midi::{MidiEvent, MidiGateway};

/// Largest 14-bit pitch bend value; 8192 is centre
pub const PITCH_BEND_MAX: u32 = 16_383;

/// Range check an event built from client input
pub fn validate_event(event: &MidiEvent) -> Result<(), ValidationError> {
    ValidationError::check_channel(event.channel() as usize)?;
    match *event {
        MidiEvent::NoteOn { note, velocity, .. } | MidiEvent::NoteOff { note, velocity, .. } => {
            ValidationError::check_data("note", note as u32)?;
            ValidationError::check_data("velocity", velocity as u32)?;
        }
        MidiEvent::ControlChange {
            controller, value, ..
        } => {
            ValidationError::check_data("controller", controller as u32)?;
            ValidationError::check_data("value", value as u32)?;
        }
        MidiEvent::ProgramChange { program, .. } => {
            ValidationError::check_data("program", program as u32)?;
        }
        MidiEvent::PitchBend { value, .. } => {
            if value as u32 > PITCH_BEND_MAX {
                return Err(ValidationError::ValueOutOfRange {
                    field: "pitch bend",
                    value: value as u32,
                    max: PITCH_BEND_MAX,
                });
            }
        }
    }
    Ok(())
}

pub struct ControlSurface {
    gateway: Arc<MidiGateway>,
}

impl ControlSurface {
    pub fn new(gateway: Arc<MidiGateway>) -> Self {
        Self { gateway }
    }

    fn send(&self, event: MidiEvent) -> Result<MidiEvent, ServerError> {
        self.gateway.send(&event)?;
        log::debug!("Immediate: {:?}", event);
        Ok(event)
    }

    pub fn note_on(&self, channel: u32, note: u32, velocity: u32) -> Result<MidiEvent, ServerError> {
        let event = MidiEvent::note_on(
            ValidationError::check_channel(channel as usize)?,
            ValidationError::check_data("note", note)?,
            ValidationError::check_data("velocity", velocity)?,
        );
        self.send(event)
    }

    pub fn note_off(&self, channel: u32, note: u32) -> Result<MidiEvent, ServerError> {
        let event = MidiEvent::note_off(
            ValidationError::check_channel(channel as usize)?,
            ValidationError::check_data("note", note)?,
        );
        self.send(event)
    }

    pub fn program_change(&self, channel: u32, program: u32) -> Result<MidiEvent, ServerError> {
        let event = MidiEvent::program_change(
            ValidationError::check_channel(channel as usize)?,
            ValidationError::check_data("program", program)?,
        );
        self.send(event)
    }

    pub fn control_change(
        &self,
        channel: u32,
        controller: u32,
        value: u32,
    ) -> Result<MidiEvent, ServerError> {
        let event = MidiEvent::control_change(
            ValidationError::check_channel(channel as usize)?,
            ValidationError::check_data("controller", controller)?,
            ValidationError::check_data("value", value)?,
        );
        self.send(event)
    }

    pub fn pitch_bend(&self, channel: u32, value: u32) -> Result<MidiEvent, ServerError> {
        let channel = ValidationError::check_channel(channel as usize)?;
        if value > PITCH_BEND_MAX {
            return Err(ValidationError::ValueOutOfRange {
                field: "pitch bend",
                value,
                max: PITCH_BEND_MAX,
            }
            .into());
        }
        self.send(MidiEvent::pitch_bend(channel, value as u16))
    }

    /// Panic button: silence every sounding note on every channel
    pub fn all_notes_off(&self) -> Result<(), ServerError> {
        self.gateway.all_notes_off()?;
        Ok(())
    }
}
