//! Tracker songs: model, text format and MIDI import

pub mod convert;
pub mod model;
pub mod text;

pub use convert::{midi_to_tracker, ConversionResult, ConvertOptions};
pub use model::{Cell, ControlValue, NoteCommand, Pattern, Row, Tracker};
pub use text::{parse_tracker, render_tracker};
