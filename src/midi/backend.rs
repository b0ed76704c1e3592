//! Platform MIDI output backends
//!
//! The gateway only needs to enumerate, open, write and close. `MidirPorts`
//! provides that on top of midir; `memory::MemoryPorts` is the virtual backend.

use midir::{ConnectErrorKind, MidiOutput, MidiOutputConnection};
use serde::Serialize;

use crate::error::PortError;

/// Information about a MIDI output port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Port id (index at enumeration time)
    pub id: String,
    /// Port name
    pub name: String,
}

/// An open output connection
pub trait MidiPort: Send {
    /// Write one complete MIDI message
    fn write(&mut self, bytes: &[u8]) -> Result<(), PortError>;

    /// Close the connection
    fn close(self: Box<Self>);
}

/// Enumerates and opens output ports
pub trait PortProvider: Send + Sync {
    fn list_ports(&self) -> Result<Vec<PortInfo>, PortError>;

    fn open(&self, port_id: &str) -> Result<(PortInfo, Box<dyn MidiPort>), PortError>;
}

/// Resolve a port id against an enumeration: index, exact name, then
/// case-insensitive substring.
pub fn resolve_port<'a>(ports: &'a [PortInfo], port_id: &str) -> Option<&'a PortInfo> {
    if let Some(p) = ports.iter().find(|p| p.id == port_id) {
        return Some(p);
    }
    if let Some(p) = ports.iter().find(|p| p.name == port_id) {
        return Some(p);
    }
    let needle = port_id.to_lowercase();
    ports
        .iter()
        .find(|p| p.name.to_lowercase().contains(&needle))
}

/// Hardware/virtual ports through midir
pub struct MidirPorts {
    client_name: String,
}

impl MidirPorts {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn output(&self, suffix: &str) -> Result<MidiOutput, PortError> {
        MidiOutput::new(&format!("{}-{}", self.client_name, suffix))
            .map_err(|e| PortError::IoFailure(format!("Failed to create MIDI output: {}", e)))
    }
}

impl PortProvider for MidirPorts {
    fn list_ports(&self) -> Result<Vec<PortInfo>, PortError> {
        let midi_out = self.output("enumerate")?;

        let ports = midi_out.ports();
        let mut infos = Vec::with_capacity(ports.len());

        for (index, port) in ports.iter().enumerate() {
            let name = midi_out
                .port_name(port)
                .unwrap_or_else(|_| format!("Unknown Device {}", index));
            infos.push(PortInfo {
                id: index.to_string(),
                name,
            });
        }

        Ok(infos)
    }

    fn open(&self, port_id: &str) -> Result<(PortInfo, Box<dyn MidiPort>), PortError> {
        let midi_out = self.output("output")?;
        let ports = midi_out.ports();

        let infos: Vec<PortInfo> = ports
            .iter()
            .enumerate()
            .map(|(index, port)| PortInfo {
                id: index.to_string(),
                name: midi_out
                    .port_name(port)
                    .unwrap_or_else(|_| format!("Device {}", index)),
            })
            .collect();

        let info = resolve_port(&infos, port_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(port_id.to_string()))?;

        let index: usize = info
            .id
            .parse()
            .map_err(|_| PortError::NotFound(port_id.to_string()))?;
        let port = ports
            .get(index)
            .ok_or_else(|| PortError::NotFound(port_id.to_string()))?;

        log::info!("Opening MIDI output: {}", info.name);

        let connection = midi_out
            .connect(port, &format!("{}-out", self.client_name))
            .map_err(|e| match e.kind() {
                ConnectErrorKind::InvalidPort => PortError::NotFound(info.name.clone()),
                ConnectErrorKind::Other(reason) => {
                    PortError::Busy(format!("{}: {}", info.name, reason))
                }
            })?;

        Ok((info, Box::new(MidirPort { connection })))
    }
}

struct MidirPort {
    connection: MidiOutputConnection,
}

impl MidiPort for MidirPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        self.connection
            .send(bytes)
            .map_err(|e| PortError::IoFailure(e.to_string()))
    }

    fn close(self: Box<Self>) {
        let port = *self;
        // Returns the MidiOutput, which is dropped here
        let _ = port.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> Vec<PortInfo> {
        vec![
            PortInfo {
                id: "0".into(),
                name: "Midi Through Port-0".into(),
            },
            PortInfo {
                id: "1".into(),
                name: "IAC Driver Bus 1".into(),
            },
        ]
    }

    #[test]
    fn test_resolve_by_index_and_name() {
        let ports = ports();
        assert_eq!(resolve_port(&ports, "1").map(|p| p.id.as_str()), Some("1"));
        assert_eq!(
            resolve_port(&ports, "Midi Through Port-0").map(|p| p.id.as_str()),
            Some("0")
        );
    }

    #[test]
    fn test_resolve_by_substring() {
        let ports = ports();
        assert_eq!(resolve_port(&ports, "iac").map(|p| p.id.as_str()), Some("1"));
        assert!(resolve_port(&ports, "fluidsynth").is_none());
    }

    #[test]
    fn test_midir_list_ports() {
        let provider = MidirPorts::new("midimcp-test");
        // Must not panic without hardware; backend init may still fail on CI
        let _ = provider.list_ports();
    }
}
