//! In-memory virtual MIDI backend
//!
//! Records writes instead of talking to hardware. Used for dry runs
//! (`backend: "memory"`) and as the port double in tests. Only the most
//! recent writes are kept. Tests can slow writes down, make them fail, or
//! yield between bytes so unserialized concurrent writers would interleave.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use parking_lot::Mutex;

use super::backend::{resolve_port, MidiPort, PortInfo, PortProvider};
use super::events::MidiEvent;
use crate::error::PortError;

/// A recorded message with its arrival time
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub at: Instant,
    pub bytes: Vec<u8>,
}

/// Messages kept by default; the byte stream keeps three bytes per message
pub const DEFAULT_RECORD_LIMIT: usize = 10_000;

struct MemoryState {
    /// Flat byte stream as the device would see it
    stream: VecDeque<u8>,
    /// Write boundaries as seen by the port
    messages: VecDeque<RecordedMessage>,
    record_limit: usize,
}

impl MemoryState {
    fn new(record_limit: usize) -> Self {
        Self {
            stream: VecDeque::new(),
            messages: VecDeque::new(),
            record_limit,
        }
    }

    fn push_byte(&mut self, byte: u8) {
        if self.stream.len() >= self.record_limit * 3 {
            self.stream.pop_front();
        }
        self.stream.push_back(byte);
    }

    fn push_message(&mut self, bytes: &[u8]) {
        if self.messages.len() >= self.record_limit {
            self.messages.pop_front();
        }
        self.messages.push_back(RecordedMessage {
            at: Instant::now(),
            bytes: bytes.to_vec(),
        });
    }
}

/// How writes behave, shared by every port opened from one `MemoryPorts`
#[derive(Debug, Clone, Copy, Default)]
struct WriteBehaviour {
    fail: bool,
    byte_yield: bool,
    delay: Duration,
}

/// Virtual ports backed by shared in-memory logs
#[derive(Clone)]
pub struct MemoryPorts {
    ports: Vec<PortInfo>,
    state: Arc<Mutex<MemoryState>>,
    behaviour: Arc<Mutex<WriteBehaviour>>,
    busy: Arc<Mutex<bool>>,
    open_count: Arc<Mutex<usize>>,
}

impl MemoryPorts {
    pub fn new() -> Self {
        Self::with_ports(&["Virtual Output"])
    }

    pub fn with_ports(names: &[&str]) -> Self {
        Self {
            ports: names
                .iter()
                .enumerate()
                .map(|(i, name)| PortInfo {
                    id: i.to_string(),
                    name: name.to_string(),
                })
                .collect(),
            state: Arc::new(Mutex::new(MemoryState::new(DEFAULT_RECORD_LIMIT))),
            behaviour: Arc::new(Mutex::new(WriteBehaviour::default())),
            busy: Arc::new(Mutex::new(false)),
            open_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Keep at most `limit` messages, dropping the oldest
    pub fn with_record_limit(self, limit: usize) -> Self {
        self.state.lock().record_limit = limit.max(1);
        self
    }

    /// Make subsequent writes fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.behaviour.lock().fail = fail;
    }

    /// Yield to other threads between the bytes of each write
    pub fn set_byte_yield(&self, byte_yield: bool) {
        self.behaviour.lock().byte_yield = byte_yield;
    }

    /// Make every write take at least `delay`, like a slow device
    pub fn set_write_delay(&self, delay: Duration) {
        self.behaviour.lock().delay = delay;
    }

    /// Make subsequent opens fail as if another client held the port
    pub fn set_busy(&self, busy: bool) {
        *self.busy.lock() = busy;
    }

    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.state.lock().messages.iter().cloned().collect()
    }

    pub fn stream(&self) -> Vec<u8> {
        self.state.lock().stream.iter().copied().collect()
    }

    /// Recorded messages decoded back into events
    pub fn events(&self) -> Vec<MidiEvent> {
        self.state
            .lock()
            .messages
            .iter()
            .filter_map(|m| MidiEvent::from_bytes(&m.bytes))
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.stream.clear();
        state.messages.clear();
    }

    /// Number of currently open connections
    pub fn open_connections(&self) -> usize {
        *self.open_count.lock()
    }
}

impl Default for MemoryPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProvider for MemoryPorts {
    fn list_ports(&self) -> Result<Vec<PortInfo>, PortError> {
        Ok(self.ports.clone())
    }

    fn open(&self, port_id: &str) -> Result<(PortInfo, Box<dyn MidiPort>), PortError> {
        let info = resolve_port(&self.ports, port_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(port_id.to_string()))?;

        if *self.busy.lock() {
            return Err(PortError::Busy(info.name));
        }

        *self.open_count.lock() += 1;
        Ok((
            info,
            Box::new(MemoryPort {
                state: Arc::clone(&self.state),
                behaviour: Arc::clone(&self.behaviour),
                open_count: Arc::clone(&self.open_count),
            }),
        ))
    }
}

struct MemoryPort {
    state: Arc<Mutex<MemoryState>>,
    behaviour: Arc<Mutex<WriteBehaviour>>,
    open_count: Arc<Mutex<usize>>,
}

impl MidiPort for MemoryPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        let behaviour = *self.behaviour.lock();
        if behaviour.fail {
            return Err(PortError::IoFailure("virtual port write failed".to_string()));
        }
        if !behaviour.delay.is_zero() {
            thread::sleep(behaviour.delay);
        }

        if behaviour.byte_yield {
            for &byte in bytes {
                self.state.lock().push_byte(byte);
                thread::yield_now();
            }
        } else {
            let mut state = self.state.lock();
            for &byte in bytes {
                state.push_byte(byte);
            }
        }

        self.state.lock().push_message(bytes);
        Ok(())
    }

    fn close(self: Box<Self>) {
        let mut count = self.open_count.lock();
        *count = count.saturating_sub(1);
    }
}
