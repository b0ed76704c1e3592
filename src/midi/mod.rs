//! MIDI events, output ports and file import

pub mod backend;
pub mod events;
pub mod file;
pub mod gateway;
pub mod memory;

pub use backend::{MidiPort, MidirPorts, PortInfo, PortProvider};
pub use events::{MidiEvent, RawMessage, ScheduledEvent, CC_ALL_NOTES_OFF};
pub use gateway::{MidiGateway, NoteOwner};
pub use memory::MemoryPorts;
