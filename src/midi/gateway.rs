//! MIDI output gateway
//!
//! Owns the single open output connection and is the only place bytes leave
//! the process. All writers (scheduler threads, immediate control calls) go
//! through one lock, so messages are never interleaved on the wire. The same
//! lock guards the record of which notes are currently sounding and who
//! started them, which is what playback cancellation and panic use to flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use super::backend::{MidiPort, PortInfo, PortProvider};
use super::events::{MidiEvent, CC_ALL_NOTES_OFF};
use crate::error::PortError;

/// Who started a sounding note
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NoteOwner {
    /// Immediate control surface commands
    Immediate,
    /// A playback session, by id
    Session(String),
}

/// Active output connection
struct ActiveConnection {
    info: PortInfo,
    port: Box<dyn MidiPort>,
}

#[derive(Default)]
struct GatewayState {
    connection: Option<ActiveConnection>,
    /// (channel, note) -> owner
    sounding: HashMap<(u8, u8), NoteOwner>,
}

impl GatewayState {
    fn write(&mut self, event: &MidiEvent) -> Result<(), PortError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| PortError::NotFound("no MIDI port connected".to_string()))?;
        connection.port.write(&event.to_bytes())
    }

    fn track(&mut self, owner: &NoteOwner, event: &MidiEvent) {
        match *event {
            MidiEvent::NoteOn {
                channel,
                note,
                velocity,
            } if velocity > 0 => {
                self.sounding.insert((channel, note), owner.clone());
            }
            MidiEvent::NoteOn { channel, note, .. } | MidiEvent::NoteOff { channel, note, .. } => {
                self.sounding.remove(&(channel, note));
            }
            MidiEvent::ControlChange {
                channel,
                controller: CC_ALL_NOTES_OFF,
                ..
            } => {
                self.sounding.retain(|(ch, _), _| *ch != channel);
            }
            _ => {}
        }
    }

    /// Send note offs for the given keys, continuing past failures.
    /// Returns the number sent and the first error.
    fn flush(&mut self, keys: Vec<(u8, u8)>) -> (usize, Option<PortError>) {
        let mut sent = 0;
        let mut first_error = None;
        for (channel, note) in keys {
            self.sounding.remove(&(channel, note));
            if self.connection.is_none() {
                continue;
            }
            match self.write(&MidiEvent::note_off(channel, note)) {
                Ok(()) => sent += 1,
                Err(e) => {
                    log::warn!("Note off flush failed for ch={} note={}: {}", channel, note, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        (sent, first_error)
    }
}

/// Process-wide MIDI output gateway
pub struct MidiGateway {
    provider: Arc<dyn PortProvider>,
    state: Mutex<GatewayState>,
    sent_count: AtomicU64,
}

impl MidiGateway {
    pub fn new(provider: Arc<dyn PortProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(GatewayState::default()),
            sent_count: AtomicU64::new(0),
        }
    }

    /// List output ports offered by the backend
    pub fn list_ports(&self) -> Result<Vec<PortInfo>, PortError> {
        self.provider.list_ports()
    }

    /// Connect to an output port by id or name, replacing any open connection
    pub fn connect(&self, port_id: &str) -> Result<PortInfo, PortError> {
        self.disconnect();

        let (info, port) = self.provider.open(port_id)?;
        log::info!("Connected to MIDI output: {} (id {})", info.name, info.id);

        let mut state = self.state.lock();
        state.connection = Some(ActiveConnection {
            info: info.clone(),
            port,
        });
        Ok(info)
    }

    /// Disconnect from the current port, silencing anything still sounding
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        if state.connection.is_none() {
            return;
        }

        let keys: Vec<_> = state.sounding.keys().copied().collect();
        let (flushed, _) = state.flush(keys);
        if let Some(active) = state.connection.take() {
            log::info!(
                "Disconnecting from MIDI output: {} ({} notes flushed)",
                active.info.name,
                flushed
            );
            active.port.close();
        }
        state.sounding.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    pub fn connected_port(&self) -> Option<PortInfo> {
        self.state
            .lock()
            .connection
            .as_ref()
            .map(|c| c.info.clone())
    }

    /// Send an immediate event
    pub fn send(&self, event: &MidiEvent) -> Result<(), PortError> {
        self.send_as(&NoteOwner::Immediate, event)
    }

    /// Send an event on behalf of `owner`. The sounding-note record is only
    /// updated once the write succeeded.
    pub fn send_as(&self, owner: &NoteOwner, event: &MidiEvent) -> Result<(), PortError> {
        let mut state = self.state.lock();
        state.write(event)?;
        state.track(owner, event);
        self.sent_count.fetch_add(1, Ordering::Relaxed);
        log::trace!("MIDI out: {:?}", event);
        Ok(())
    }

    /// Send note off for every note `owner` left sounding.
    ///
    /// Bookkeeping is cleared even when writes fail so a dead port cannot
    /// leave phantom notes behind. Returns the number of note offs written.
    pub fn release(&self, owner: &NoteOwner) -> Result<usize, PortError> {
        let mut state = self.state.lock();
        let keys: Vec<_> = state
            .sounding
            .iter()
            .filter(|(_, o)| *o == owner)
            .map(|(k, _)| *k)
            .collect();
        match state.flush(keys) {
            (_, Some(e)) => Err(e),
            (sent, None) => Ok(sent),
        }
    }

    /// Panic: note off for every sounding note, then CC 123 on all channels.
    /// Resets the sounding record regardless of the outcome.
    pub fn all_notes_off(&self) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if state.connection.is_none() {
            state.sounding.clear();
            return Err(PortError::NotFound("no MIDI port connected".to_string()));
        }

        let keys: Vec<_> = state.sounding.keys().copied().collect();
        let (_, mut first_error) = state.flush(keys);

        for channel in 0..16 {
            let event = MidiEvent::control_change(channel, CC_ALL_NOTES_OFF, 0);
            if let Err(e) = state.write(&event) {
                first_error.get_or_insert(e);
            }
        }
        state.sounding.clear();
        log::info!("All notes off");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Currently sounding (channel, note) pairs, sorted
    pub fn sounding_notes(&self) -> Vec<(u8, u8)> {
        let mut notes: Vec<_> = self.state.lock().sounding.keys().copied().collect();
        notes.sort_unstable();
        notes
    }

    /// Sounding notes started by `owner`, sorted
    pub fn sounding_for(&self, owner: &NoteOwner) -> Vec<(u8, u8)> {
        let mut notes: Vec<_> = self
            .state
            .lock()
            .sounding
            .iter()
            .filter(|(_, o)| *o == owner)
            .map(|(k, _)| *k)
            .collect();
        notes.sort_unstable();
        notes
    }

    /// Total messages written since creation
    pub fn sent_count(&self) -> u64 {
        self.sent_count.load(Ordering::Relaxed)
    }
}

impl Drop for MidiGateway {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::memory::MemoryPorts;
    use std::thread;

    fn connected() -> (MemoryPorts, Arc<MidiGateway>) {
        let ports = MemoryPorts::new();
        let gateway = Arc::new(MidiGateway::new(Arc::new(ports.clone())));
        gateway.connect("0").unwrap();
        (ports, gateway)
    }

    #[test]
    fn test_send_without_port() {
        let gateway = MidiGateway::new(Arc::new(MemoryPorts::new()));
        assert!(!gateway.is_connected());
        assert!(matches!(
            gateway.send(&MidiEvent::note_on(0, 60, 100)),
            Err(PortError::NotFound(_))
        ));
        assert!(gateway.sounding_notes().is_empty());
    }

    #[test]
    fn test_tracks_sounding_notes() {
        let (_ports, gateway) = connected();
        gateway.send(&MidiEvent::note_on(0, 60, 100)).unwrap();
        gateway.send(&MidiEvent::note_on(1, 64, 100)).unwrap();
        gateway.send(&MidiEvent::note_off(0, 60)).unwrap();
        gateway.send(&MidiEvent::note_on(2, 67, 0)).unwrap();
        assert_eq!(gateway.sounding_notes(), vec![(1, 64)]);
        assert_eq!(gateway.sent_count(), 4);
    }

    #[test]
    fn test_release_only_touches_owner() {
        let (ports, gateway) = connected();
        let session = NoteOwner::Session("song".into());
        gateway.send_as(&session, &MidiEvent::note_on(0, 60, 100)).unwrap();
        gateway.send_as(&session, &MidiEvent::note_on(0, 62, 100)).unwrap();
        gateway.send(&MidiEvent::note_on(5, 40, 100)).unwrap();
        ports.clear();

        assert_eq!(gateway.release(&session).unwrap(), 2);
        assert_eq!(gateway.sounding_notes(), vec![(5, 40)]);

        let mut offs = ports.events();
        offs.sort_by_key(|e| match e {
            MidiEvent::NoteOff { note, .. } => *note,
            _ => 0,
        });
        assert_eq!(
            offs,
            vec![MidiEvent::note_off(0, 60), MidiEvent::note_off(0, 62)]
        );
    }

    #[test]
    fn test_all_notes_off_resets_everything() {
        let (ports, gateway) = connected();
        let session = NoteOwner::Session("song".into());
        gateway.send_as(&session, &MidiEvent::note_on(3, 60, 100)).unwrap();
        gateway.send(&MidiEvent::note_on(4, 61, 100)).unwrap();
        ports.clear();

        gateway.all_notes_off().unwrap();
        assert!(gateway.sounding_notes().is_empty());
        assert!(gateway.sounding_for(&session).is_empty());

        let events = ports.events();
        // 2 explicit note offs + CC123 on 16 channels
        assert_eq!(events.len(), 18);
        assert!(events[2..]
            .iter()
            .all(|e| matches!(e, MidiEvent::ControlChange { controller: 123, .. })));

        // Nothing left for a later session release to flush
        assert_eq!(gateway.release(&session).unwrap(), 0);
    }

    #[test]
    fn test_release_clears_even_when_port_fails() {
        let (ports, gateway) = connected();
        let session = NoteOwner::Session("s".into());
        gateway.send_as(&session, &MidiEvent::note_on(0, 60, 100)).unwrap();

        ports.set_fail_writes(true);
        assert!(matches!(
            gateway.release(&session),
            Err(PortError::IoFailure(_))
        ));
        assert!(gateway.sounding_notes().is_empty());
    }

    #[test]
    fn test_disconnect_flushes_and_closes() {
        let (ports, gateway) = connected();
        gateway.send(&MidiEvent::note_on(0, 60, 100)).unwrap();
        ports.clear();

        gateway.disconnect();
        assert!(!gateway.is_connected());
        assert_eq!(ports.open_connections(), 0);
        assert_eq!(ports.events(), vec![MidiEvent::note_off(0, 60)]);
    }

    #[test]
    fn test_reconnect_replaces_connection() {
        let (ports, gateway) = connected();
        let info = gateway.connect("Virtual").unwrap();
        assert_eq!(info.id, "0");
        assert_eq!(ports.open_connections(), 1);
    }

    #[test]
    fn test_concurrent_sends_never_interleave() {
        let (ports, gateway) = connected();
        ports.set_byte_yield(true);

        let handles: Vec<_> = (0..8u8)
            .map(|channel| {
                let gateway = Arc::clone(&gateway);
                thread::spawn(move || {
                    for note in 0..50u8 {
                        gateway
                            .send(&MidiEvent::note_on(channel, note, 100))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stream = ports.stream();
        assert_eq!(stream.len(), 8 * 50 * 3);
        for chunk in stream.chunks(3) {
            assert_eq!(chunk[0] & 0xF0, 0x90, "status byte expected, got {:?}", chunk);
            assert!(chunk[1] < 0x80 && chunk[2] == 100);
        }
    }
}
