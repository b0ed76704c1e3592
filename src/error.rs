//! Error types shared across the server
//!
//! Each family maps to one concern: the output port, session bookkeeping,
//! MIDI/tracker input formats and request validation. `ServerError` wraps them
//! all for the dispatch layer.

use thiserror::Error;

/// Failures talking to the MIDI output device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("MIDI port not found: {0}")]
    NotFound(String),

    #[error("MIDI port busy: {0}")]
    Busy(String),

    #[error("MIDI port I/O failure: {0}")]
    IoFailure(String),
}

/// Failures looking up or transitioning playback sessions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session id already registered: {0}")]
    DuplicateId(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for session {id}: {reason}")]
    InvalidTransition { id: String, reason: String },
}

/// Failures decoding uploaded MIDI files or tracker text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Malformed file: {0}")]
    MalformedFile(String),

    #[error("Unsupported event: {0}")]
    UnsupportedEvent(String),
}

/// Request values rejected before touching scheduler or gateway state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Channel {0} out of range (0-15)")]
    ChannelOutOfRange(usize),

    #[error("Tempo must be positive, got {0}")]
    TempoNonPositive(String),

    #[error("Ticks per beat and ticks per row must be positive")]
    ResolutionNonPositive,

    #[error("{field} value {value} out of range (max {max})")]
    ValueOutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },

    #[error("{what} has {rows} rows, limit is {max}")]
    TooManyRows {
        what: &'static str,
        rows: usize,
        max: usize,
    },

    #[error("Pattern {0} is not defined")]
    UnknownPattern(usize),
}

impl ValidationError {
    /// Check a MIDI data byte (note, velocity, controller, value, program)
    pub fn check_data(field: &'static str, value: u32) -> Result<u8, ValidationError> {
        if value > 127 {
            return Err(ValidationError::ValueOutOfRange {
                field,
                value,
                max: 127,
            });
        }
        Ok(value as u8)
    }

    /// Check a MIDI channel (0-15)
    pub fn check_channel(channel: usize) -> Result<u8, ValidationError> {
        if channel > 15 {
            return Err(ValidationError::ChannelOutOfRange(channel));
        }
        Ok(channel as u8)
    }
}

/// Top-level error returned by the command dispatcher
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::InvalidParams(e.to_string())
    }
}
