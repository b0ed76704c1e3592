//! Command dispatch
//!
//! Every transport funnels into `MidiServer::handle(method, params)`, so a
//! note sent over stdio and one sent over TCP take the same path to the
//! gateway. Handlers are synchronous; a stop waits for the session's note off
//! flush, so async callers run them on the blocking pool.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{BackendKind, ServerConfig};
use crate::control::{validate_event, ControlSurface};
use crate::error::{FormatError, ServerError};
use crate::logging;
use crate::midi::file::{parse_midi_bytes, ParsedMidiFile};
use crate::midi::{MemoryPorts, MidiGateway, MidiEvent, MidirPorts, PortProvider, ScheduledEvent};
use crate::playback::{
    PlaybackFeed, Sequence, SequencePlayer, SessionEntry, SessionRegistry, SessionSource,
};
use crate::tracker::model::DEFAULT_VELOCITY;
use crate::tracker::{midi_to_tracker, parse_tracker, render_tracker, ConvertOptions, Tracker};

/// A dispatch method as advertised to MCP clients
pub struct MethodInfo {
    pub name: &'static str,
    pub description: &'static str,
    /// (parameter, JSON type, required)
    pub params: &'static [(&'static str, &'static str, bool)],
}

const FILE_ID: (&str, &str, bool) = ("fileId", "string", true);

pub const METHODS: &[MethodInfo] = &[
    MethodInfo {
        name: "serverInfo",
        description: "Server version, backend, connected port and session count",
        params: &[],
    },
    MethodInfo {
        name: "listPorts",
        description: "List MIDI output ports",
        params: &[],
    },
    MethodInfo {
        name: "connectPort",
        description: "Connect to an output port by id or name, stopping playback first",
        params: &[("portId", "string", true)],
    },
    MethodInfo {
        name: "disconnectPort",
        description: "Stop all playback and close the output port",
        params: &[],
    },
    MethodInfo {
        name: "portStatus",
        description: "Connected port, sounding notes and messages sent",
        params: &[],
    },
    MethodInfo {
        name: "noteOn",
        description: "Send a note on (channel 0-15, note 0-127, velocity 0-127)",
        params: &[
            ("channel", "integer", true),
            ("note", "integer", true),
            ("velocity", "integer", false),
        ],
    },
    MethodInfo {
        name: "noteOff",
        description: "Send a note off",
        params: &[("channel", "integer", true), ("note", "integer", true)],
    },
    MethodInfo {
        name: "programChange",
        description: "Send a program change",
        params: &[("channel", "integer", true), ("program", "integer", true)],
    },
    MethodInfo {
        name: "controlChange",
        description: "Send a control change",
        params: &[
            ("channel", "integer", true),
            ("controller", "integer", true),
            ("value", "integer", true),
        ],
    },
    MethodInfo {
        name: "pitchBend",
        description: "Send a pitch bend (0-16383, 8192 is centre)",
        params: &[("channel", "integer", true), ("value", "integer", true)],
    },
    MethodInfo {
        name: "allNotesOff",
        description: "Silence every sounding note on every channel",
        params: &[],
    },
    MethodInfo {
        name: "loadFile",
        description: "Load a Standard MIDI File from a path",
        params: &[("path", "string", true), ("id", "string", false), ("name", "string", false)],
    },
    MethodInfo {
        name: "loadContent",
        description: "Load a Standard MIDI File from base64 content",
        params: &[("content", "string", true), ("id", "string", false), ("name", "string", false)],
    },
    MethodInfo {
        name: "loadTracker",
        description: "Load a tracker song from text or JSON",
        params: &[
            ("content", "string", false),
            ("tracker", "object", false),
            ("id", "string", false),
            ("name", "string", false),
        ],
    },
    MethodInfo {
        name: "listFiles",
        description: "List loaded files and songs",
        params: &[],
    },
    MethodInfo {
        name: "fileInfo",
        description: "Details of a loaded file or song",
        params: &[FILE_ID],
    },
    MethodInfo {
        name: "removeFile",
        description: "Stop and unload a file or song",
        params: &[FILE_ID],
    },
    MethodInfo {
        name: "playFile",
        description: "Start playback, resuming after a pause",
        params: &[FILE_ID],
    },
    MethodInfo {
        name: "pauseFile",
        description: "Stop playback and remember the position",
        params: &[FILE_ID],
    },
    MethodInfo {
        name: "stopFile",
        description: "Stop playback and rewind",
        params: &[FILE_ID],
    },
    MethodInfo {
        name: "sessionStatus",
        description: "Playback state, position and timing counters",
        params: &[FILE_ID],
    },
    MethodInfo {
        name: "listSessions",
        description: "Playback status of every session",
        params: &[],
    },
    MethodInfo {
        name: "insertEvents",
        description: "Merge events (offsetMs from sequence start) into a playing session",
        params: &[FILE_ID, ("events", "array", true)],
    },
    MethodInfo {
        name: "convertToSong",
        description: "Quantize a loaded MIDI file into a tracker song",
        params: &[
            FILE_ID,
            ("ticksPerBeat", "integer", false),
            ("rowsPerPattern", "integer", false),
            ("register", "boolean", false),
            ("id", "string", false),
        ],
    },
];

pub fn method_info(name: &str) -> Option<&'static MethodInfo> {
    METHODS.iter().find(|m| m.name == name)
}

fn default_velocity() -> u32 {
    DEFAULT_VELOCITY as u32
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortParams {
    port_id: String,
}

#[derive(Deserialize)]
struct NoteOnParams {
    channel: u32,
    note: u32,
    #[serde(default = "default_velocity")]
    velocity: u32,
}

#[derive(Deserialize)]
struct NoteOffParams {
    channel: u32,
    note: u32,
}

#[derive(Deserialize)]
struct ProgramParams {
    channel: u32,
    program: u32,
}

#[derive(Deserialize)]
struct ControlParams {
    channel: u32,
    controller: u32,
    value: u32,
}

#[derive(Deserialize)]
struct PitchBendParams {
    channel: u32,
    value: u32,
}

#[derive(Deserialize)]
struct LoadFileParams {
    path: PathBuf,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct LoadContentParams {
    content: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct LoadTrackerParams {
    content: Option<String>,
    tracker: Option<Tracker>,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileParams {
    file_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimedEvent {
    offset_ms: f64,
    #[serde(flatten)]
    event: MidiEvent,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertParams {
    file_id: String,
    events: Vec<TimedEvent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConvertParams {
    file_id: String,
    ticks_per_beat: Option<u32>,
    rows_per_pattern: Option<usize>,
    #[serde(default)]
    register: bool,
    id: Option<String>,
}

/// Missing params are treated as an empty object
fn parse<T: DeserializeOwned>(params: Value) -> Result<T, ServerError> {
    let params = if params.is_null() { json!({}) } else { params };
    Ok(serde_json::from_value(params)?)
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ServerError> {
    serde_json::to_value(value).map_err(|e| ServerError::InvalidParams(e.to_string()))
}

pub struct MidiServer {
    config: ServerConfig,
    gateway: Arc<MidiGateway>,
    control: ControlSurface,
    registry: SessionRegistry,
    feed: PlaybackFeed,
    started_at: DateTime<Utc>,
}

impl MidiServer {
    pub fn new(config: ServerConfig, provider: Arc<dyn PortProvider>) -> Self {
        let gateway = Arc::new(MidiGateway::new(provider));
        Self {
            control: ControlSurface::new(Arc::clone(&gateway)),
            feed: PlaybackFeed::new(config.feed_capacity),
            registry: SessionRegistry::new(),
            started_at: Utc::now(),
            gateway,
            config,
        }
    }

    /// Build with the backend named in the config
    pub fn from_config(config: ServerConfig) -> Self {
        let provider: Arc<dyn PortProvider> = match config.backend {
            BackendKind::Midir => Arc::new(MidirPorts::new(config.client_name.clone())),
            BackendKind::Memory => Arc::new(MemoryPorts::new()),
        };
        Self::new(config, provider)
    }

    pub fn feed(&self) -> &PlaybackFeed {
        &self.feed
    }

    pub fn gateway(&self) -> &Arc<MidiGateway> {
        &self.gateway
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connect the configured default port, if any. Failure is logged only.
    pub fn connect_default_port(&self) {
        let Some(port) = self.config.default_port.as_deref() else {
            return;
        };
        if let Err(e) = self.gateway.connect(port) {
            log::warn!("Could not connect default port '{}': {}", port, e);
        }
    }

    /// Stop every session and release the port
    pub fn shutdown(&self) {
        let stopped = self.registry.stop_all();
        self.gateway.disconnect();
        log::info!("Server shut down ({} sessions stopped)", stopped);
    }

    /// Run one command
    pub fn handle(&self, method: &str, params: Value) -> Result<Value, ServerError> {
        log::debug!("Dispatch {}", method);
        match method {
            "serverInfo" => self.server_info(),
            "listPorts" => Ok(json!({
                "ports": self.gateway.list_ports()?,
                "connected": self.gateway.connected_port(),
            })),
            "connectPort" => {
                let p: PortParams = parse(params)?;
                let stopped = self.registry.stop_all();
                let port = self.gateway.connect(&p.port_id)?;
                Ok(json!({ "port": port, "stoppedSessions": stopped }))
            }
            "disconnectPort" => {
                let was_connected = self.gateway.is_connected();
                let stopped = self.registry.stop_all();
                self.gateway.disconnect();
                Ok(json!({ "disconnected": was_connected, "stoppedSessions": stopped }))
            }
            "portStatus" => Ok(json!({
                "connected": self.gateway.is_connected(),
                "port": self.gateway.connected_port(),
                "soundingNotes": self.gateway.sounding_notes().len(),
                "sentMessages": self.gateway.sent_count(),
            })),
            "noteOn" => {
                let p: NoteOnParams = parse(params)?;
                let event = self.control.note_on(p.channel, p.note, p.velocity)?;
                Ok(json!({ "sent": event }))
            }
            "noteOff" => {
                let p: NoteOffParams = parse(params)?;
                let event = self.control.note_off(p.channel, p.note)?;
                Ok(json!({ "sent": event }))
            }
            "programChange" => {
                let p: ProgramParams = parse(params)?;
                let event = self.control.program_change(p.channel, p.program)?;
                Ok(json!({ "sent": event }))
            }
            "controlChange" => {
                let p: ControlParams = parse(params)?;
                let event = self.control.control_change(p.channel, p.controller, p.value)?;
                Ok(json!({ "sent": event }))
            }
            "pitchBend" => {
                let p: PitchBendParams = parse(params)?;
                let event = self.control.pitch_bend(p.channel, p.value)?;
                Ok(json!({ "sent": event }))
            }
            "allNotesOff" => {
                self.control.all_notes_off()?;
                Ok(json!({ "ok": true }))
            }
            "loadFile" => self.load_file(parse(params)?),
            "loadContent" => self.load_content(parse(params)?),
            "loadTracker" => self.load_tracker(parse(params)?),
            "listFiles" => Ok(json!({ "files": self.registry.list_sessions() })),
            "fileInfo" => {
                let p: FileParams = parse(params)?;
                self.file_info(&p.file_id)
            }
            "removeFile" => {
                let p: FileParams = parse(params)?;
                self.registry.remove(&p.file_id)?;
                Ok(json!({ "removed": p.file_id }))
            }
            "playFile" => {
                let p: FileParams = parse(params)?;
                to_value(&self.registry.require(&p.file_id)?.player.play()?)
            }
            "pauseFile" => {
                let p: FileParams = parse(params)?;
                to_value(&self.registry.require(&p.file_id)?.player.pause()?)
            }
            "stopFile" => {
                let p: FileParams = parse(params)?;
                to_value(&self.registry.require(&p.file_id)?.player.stop())
            }
            "sessionStatus" => {
                let p: FileParams = parse(params)?;
                to_value(&self.registry.require(&p.file_id)?.player.status())
            }
            "listSessions" => {
                let ids: Vec<String> = self
                    .registry
                    .list_sessions()
                    .into_iter()
                    .map(|s| s.id)
                    .collect();
                let sessions: Vec<_> = ids
                    .iter()
                    .filter_map(|id| self.registry.get(id))
                    .map(|e| e.player.status())
                    .collect();
                Ok(json!({ "sessions": sessions }))
            }
            "insertEvents" => self.insert_events(parse(params)?),
            "convertToSong" => self.convert_to_song(parse(params)?),
            other => Err(ServerError::MethodNotFound(other.to_string())),
        }
    }

    fn server_info(&self) -> Result<Value, ServerError> {
        Ok(json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "backend": self.config.backend,
            "port": self.gateway.connected_port(),
            "sessions": self.registry.len(),
            "subscribers": self.feed.subscriber_count(),
            "logFile": logging::log_file_path(),
            "startedAt": self.started_at,
        }))
    }

    fn session_id(&self, requested: Option<String>) -> Result<String, ServerError> {
        match requested {
            Some(id) if id.trim().is_empty() => {
                Err(ServerError::InvalidParams("id must not be empty".to_string()))
            }
            Some(id) => Ok(id),
            None => Ok(uuid::Uuid::new_v4().to_string()),
        }
    }

    fn register(
        &self,
        id: String,
        name: String,
        source: SessionSource,
        sequence: Sequence,
    ) -> Result<Arc<SessionEntry>, ServerError> {
        let player = SequencePlayer::new(
            &id,
            Arc::new(sequence),
            Arc::clone(&self.gateway),
            self.feed.clone(),
            self.config.jitter_tolerance(),
        );
        let entry = SessionEntry {
            id,
            name,
            source,
            player,
            loaded_at: Utc::now(),
        };
        Ok(self.registry.register(entry)?)
    }

    fn check_size(&self, len: u64) -> Result<(), ServerError> {
        if len > self.config.max_file_bytes {
            return Err(FormatError::MalformedFile(format!(
                "file is {} bytes, limit is {}",
                len, self.config.max_file_bytes
            ))
            .into());
        }
        Ok(())
    }

    fn register_midi(
        &self,
        data: &[u8],
        name: String,
        id: Option<String>,
    ) -> Result<Value, ServerError> {
        let id = self.session_id(id)?;
        let parsed = parse_midi_bytes(data, &name)?;
        let info = parsed.info();
        let sequence = parsed.sequence.clone();
        self.register(
            id.clone(),
            name,
            SessionSource::MidiFile(Box::new(parsed)),
            sequence,
        )?;
        Ok(json!({ "fileId": id, "info": info }))
    }

    fn load_file(&self, p: LoadFileParams) -> Result<Value, ServerError> {
        let size = fs::metadata(&p.path)?.len();
        self.check_size(size)?;
        let data = fs::read(&p.path)?;
        let name = p.name.unwrap_or_else(|| {
            p.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| p.path.display().to_string())
        });
        log::info!("Loading MIDI file {}", p.path.display());
        self.register_midi(&data, name, p.id)
    }

    fn load_content(&self, p: LoadContentParams) -> Result<Value, ServerError> {
        // Base64 inflates by 4/3; reject before decoding anything huge
        self.check_size(p.content.len() as u64 / 4 * 3)?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(p.content.trim())
            .map_err(|e| ServerError::InvalidParams(format!("content is not base64: {}", e)))?;
        self.check_size(data.len() as u64)?;
        let name = p.name.unwrap_or_else(|| "upload.mid".to_string());
        self.register_midi(&data, name, p.id)
    }

    fn load_tracker(&self, p: LoadTrackerParams) -> Result<Value, ServerError> {
        let tracker = match (p.content, p.tracker) {
            (Some(text), None) => {
                self.check_size(text.len() as u64)?;
                parse_tracker(&text)?
            }
            (None, Some(tracker)) => tracker,
            _ => {
                return Err(ServerError::InvalidParams(
                    "give exactly one of content or tracker".to_string(),
                ))
            }
        };
        let id = self.session_id(p.id)?;
        let sequence = tracker.compile()?;
        let name = p
            .name
            .or_else(|| Some(tracker.title.clone()).filter(|t| !t.is_empty()))
            .unwrap_or_else(|| "untitled".to_string());

        let summary = json!({
            "fileId": id,
            "name": name,
            "eventCount": sequence.len(),
            "noteCount": sequence.note_count(),
            "durationMs": sequence.duration_us() as f64 / 1000.0,
            "channels": sequence.channels(),
        });
        self.register(id, name, SessionSource::Tracker(Box::new(tracker)), sequence)?;
        Ok(summary)
    }

    fn file_info(&self, id: &str) -> Result<Value, ServerError> {
        let entry = self.registry.require(id)?;
        let sequence = entry.sequence();
        let mut info = json!({
            "fileId": entry.id,
            "name": entry.name,
            "kind": entry.source.kind(),
            "eventCount": sequence.len(),
            "noteCount": sequence.note_count(),
            "durationMs": sequence.duration_us() as f64 / 1000.0,
            "channels": sequence.channels(),
            "loadedAt": entry.loaded_at,
            "state": entry.player.state(),
        });
        match &entry.source {
            SessionSource::MidiFile(parsed) => info["midi"] = to_value(&parsed.info())?,
            SessionSource::Tracker(tracker) => {
                info["tracker"] = json!({
                    "title": tracker.title,
                    "bpm": tracker.bpm,
                    "ticksPerBeat": tracker.ticks_per_beat,
                    "ticksPerRow": tracker.ticks_per_row,
                    "patterns": tracker.patterns.len(),
                    "order": tracker.order,
                    "text": render_tracker(tracker),
                })
            }
        }
        Ok(info)
    }

    fn insert_events(&self, p: InsertParams) -> Result<Value, ServerError> {
        let entry = self.registry.require(&p.file_id)?;
        let mut events = Vec::with_capacity(p.events.len());
        for timed in &p.events {
            if !(timed.offset_ms.is_finite() && timed.offset_ms >= 0.0) {
                return Err(ServerError::InvalidParams(format!(
                    "offsetMs must be a non-negative number, got {}",
                    timed.offset_ms
                )));
            }
            validate_event(&timed.event)?;
            events.push(ScheduledEvent::new(
                (timed.offset_ms * 1000.0).round() as u64,
                timed.event,
            ));
        }
        let inserted = entry.player.insert_events(&events)?;
        Ok(json!({ "inserted": inserted }))
    }

    fn convert_to_song(&self, p: ConvertParams) -> Result<Value, ServerError> {
        let entry = self.registry.require(&p.file_id)?;
        let parsed: &ParsedMidiFile = match &entry.source {
            SessionSource::MidiFile(parsed) => parsed,
            SessionSource::Tracker(_) => {
                return Err(ServerError::InvalidParams(format!(
                    "{} is already a tracker song",
                    p.file_id
                )))
            }
        };

        let defaults = ConvertOptions::default();
        let options = ConvertOptions {
            ticks_per_beat: p.ticks_per_beat.unwrap_or(defaults.ticks_per_beat),
            rows_per_pattern: p.rows_per_pattern.unwrap_or(defaults.rows_per_pattern),
        };
        let result = midi_to_tracker(parsed, options)?;
        let text = render_tracker(&result.tracker);

        let mut response = json!({
            "tracker": result.tracker,
            "text": text,
            "droppedNotes": result.dropped_notes,
        });

        if p.register || p.id.is_some() {
            let id = self.session_id(p.id)?;
            let sequence = result.tracker.compile()?;
            let name = format!("{} (song)", entry.name);
            self.register(
                id.clone(),
                name,
                SessionSource::Tracker(Box::new(result.tracker)),
                sequence,
            )?;
            response["fileId"] = json!(id);
        }
        Ok(response)
    }
}

impl Drop for MidiServer {
    fn drop(&mut self) {
        self.registry.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PortError, SessionError, ValidationError};
    use crate::midi::file::tests::two_note_file;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const SONG: &str = "#TITLE: Riff\n#BPM: 240\nPATTERN 0 ROWS 4\n00 | C-4 .. .. |\n02 | E-4 .. .. |\n";

    fn server() -> (MemoryPorts, MidiServer) {
        let ports = MemoryPorts::with_ports(&["Synth A", "Synth B"]);
        let server = MidiServer::new(ServerConfig::default(), Arc::new(ports.clone()));
        server
            .handle("connectPort", json!({ "portId": "Synth A" }))
            .unwrap();
        (ports, server)
    }

    fn encoded(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    fn wait_stopped(server: &MidiServer, id: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = server
                .handle("sessionStatus", json!({ "fileId": id }))
                .unwrap();
            if status["state"] != "playing" || Instant::now() > deadline {
                return status;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_ports() {
        let (_ports, server) = server();
        let listed = server.handle("listPorts", Value::Null).unwrap();
        assert_eq!(listed["ports"].as_array().unwrap().len(), 2);
        assert_eq!(listed["connected"]["name"], "Synth A");

        let status = server.handle("portStatus", json!({})).unwrap();
        assert_eq!(status["connected"], true);

        assert!(matches!(
            server.handle("connectPort", json!({ "portId": "Nope" })),
            Err(ServerError::Port(PortError::NotFound(_)))
        ));
        assert!(matches!(
            server.handle("connectPort", json!({})),
            Err(ServerError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_immediate_notes() {
        let (ports, server) = server();
        server
            .handle("noteOn", json!({ "channel": 1, "note": 60 }))
            .unwrap();
        server
            .handle("noteOff", json!({ "channel": 1, "note": 60 }))
            .unwrap();
        assert_eq!(
            ports.events(),
            vec![
                MidiEvent::note_on(1, 60, DEFAULT_VELOCITY),
                MidiEvent::note_off(1, 60)
            ]
        );

        let err = server
            .handle("noteOn", json!({ "channel": 16, "note": 60, "velocity": 100 }))
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Validation(ValidationError::ChannelOutOfRange(16))
        ));
        assert!(matches!(
            server.handle("noteOn", json!({ "channel": -1, "note": 60 })),
            Err(ServerError::InvalidParams(_))
        ));
        assert_eq!(ports.events().len(), 2);
    }

    #[test]
    fn test_load_and_play_midi_content() {
        let (ports, server) = server();
        let loaded = server
            .handle(
                "loadContent",
                json!({ "content": encoded(&two_note_file()), "name": "two.mid", "id": "two" }),
            )
            .unwrap();
        assert_eq!(loaded["fileId"], "two");
        assert_eq!(loaded["info"]["eventCount"], 4);

        let info = server.handle("fileInfo", json!({ "fileId": "two" })).unwrap();
        assert_eq!(info["kind"], "midi");
        assert_eq!(info["durationMs"], 1000.0);

        // Speed things up by stopping early: play, stop, play again replays the start
        server.handle("playFile", json!({ "fileId": "two" })).unwrap();
        thread::sleep(Duration::from_millis(50));
        let stopped = server.handle("stopFile", json!({ "fileId": "two" })).unwrap();
        assert_eq!(stopped["state"], "stopped");
        assert_eq!(
            ports.events(),
            vec![MidiEvent::note_on(0, 60, 100), MidiEvent::note_off(0, 60)]
        );

        ports.clear();
        server.handle("playFile", json!({ "fileId": "two" })).unwrap();
        thread::sleep(Duration::from_millis(50));
        server.handle("stopFile", json!({ "fileId": "two" })).unwrap();
        assert_eq!(ports.events()[0], MidiEvent::note_on(0, 60, 100));
    }

    #[test]
    fn test_malformed_upload_leaves_registry_alone() {
        let (_ports, server) = server();
        let err = server
            .handle("loadContent", json!({ "content": encoded(b"not a midi file") }))
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Format(FormatError::MalformedFile(_))
        ));
        assert!(matches!(
            server.handle("loadContent", json!({ "content": "%%%" })),
            Err(ServerError::InvalidParams(_))
        ));
        let files = server.handle("listFiles", json!({})).unwrap();
        assert!(files["files"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_load_file_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("song.mid");
        fs::write(&path, two_note_file()).unwrap();

        let (_ports, server) = server();
        let loaded = server
            .handle("loadFile", json!({ "path": path }))
            .unwrap();
        assert_eq!(loaded["info"]["filename"], "song.mid");

        assert!(matches!(
            server.handle("loadFile", json!({ "path": dir.path().join("missing.mid") })),
            Err(ServerError::Io(_))
        ));

        let config = ServerConfig {
            max_file_bytes: 16,
            ..Default::default()
        };
        let small = MidiServer::new(config, Arc::new(MemoryPorts::new()));
        assert!(matches!(
            small.handle("loadFile", json!({ "path": path })),
            Err(ServerError::Format(FormatError::MalformedFile(_)))
        ));
    }

    #[test]
    fn test_tracker_session_lifecycle() {
        let (ports, server) = server();
        let loaded = server
            .handle("loadTracker", json!({ "content": SONG, "id": "riff" }))
            .unwrap();
        assert_eq!(loaded["name"], "Riff");
        assert_eq!(loaded["noteCount"], 2);

        // Duplicate id is rejected and the first registration survives
        let err = server
            .handle("loadTracker", json!({ "content": "PATTERN 0 ROWS 1", "id": "riff" }))
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Session(SessionError::DuplicateId(_))
        ));
        let info = server.handle("fileInfo", json!({ "fileId": "riff" })).unwrap();
        assert_eq!(info["noteCount"], 2);
        assert!(info["tracker"]["text"].as_str().unwrap().contains("E-4"));

        server.handle("playFile", json!({ "fileId": "riff" })).unwrap();
        let status = wait_stopped(&server, "riff");
        assert_eq!(status["state"], "stopped");
        assert_eq!(status["dispatched"], 4);
        assert_eq!(ports.events().len(), 4);

        let sessions = server.handle("listSessions", json!({})).unwrap();
        assert_eq!(sessions["sessions"][0]["sessionId"], "riff");

        server.handle("removeFile", json!({ "fileId": "riff" })).unwrap();
        assert!(matches!(
            server.handle("playFile", json!({ "fileId": "riff" })),
            Err(ServerError::Session(SessionError::NotFound(_)))
        ));
    }

    #[test]
    fn test_insert_events_requires_playing() {
        let (ports, server) = server();
        server
            .handle("loadTracker", json!({ "content": SONG, "id": "riff" }))
            .unwrap();
        let events = json!([{ "offsetMs": 100.0, "type": "note_on", "channel": 2, "note": 72, "velocity": 90 }]);

        assert!(matches!(
            server.handle("insertEvents", json!({ "fileId": "riff", "events": events })),
            Err(ServerError::Session(SessionError::InvalidTransition { .. }))
        ));

        server.handle("playFile", json!({ "fileId": "riff" })).unwrap();
        let bad = json!([{ "offsetMs": 10.0, "type": "note_on", "channel": 20, "note": 72, "velocity": 90 }]);
        assert!(matches!(
            server.handle("insertEvents", json!({ "fileId": "riff", "events": bad })),
            Err(ServerError::Validation(_))
        ));
        let inserted = server
            .handle("insertEvents", json!({ "fileId": "riff", "events": events }))
            .unwrap();
        assert_eq!(inserted["inserted"], 1);
        wait_stopped(&server, "riff");
        assert!(ports.events().contains(&MidiEvent::note_on(2, 72, 90)));
    }

    #[test]
    fn test_convert_to_song() {
        let (_ports, server) = server();
        server
            .handle("loadContent", json!({ "content": encoded(&two_note_file()), "id": "two" }))
            .unwrap();
        let song = server
            .handle("convertToSong", json!({ "fileId": "two", "register": true, "id": "two-song" }))
            .unwrap();
        assert_eq!(song["droppedNotes"], 0);
        assert_eq!(song["fileId"], "two-song");
        assert!(song["text"].as_str().unwrap().contains("PATTERN 0 ROWS 5"));

        let original = server.registry().sequence("two").unwrap();
        let converted = server.registry().sequence("two-song").unwrap();
        assert_eq!(original.events(), converted.events());

        assert!(matches!(
            server.handle("convertToSong", json!({ "fileId": "two-song" })),
            Err(ServerError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_oversized_songs_are_refused() {
        let (_ports, server) = server();
        assert!(matches!(
            server.handle("loadTracker", json!({ "content": "PATTERN 0 ROWS 100000000000" })),
            Err(ServerError::Format(FormatError::MalformedFile(_)))
        ));
        let rows = vec![json!([]); 2000];
        assert!(matches!(
            server.handle(
                "loadTracker",
                json!({ "tracker": { "bpm": 120.0, "ticksPerBeat": 4, "ticksPerRow": 1,
                    "patterns": [{ "index": 0, "rows": rows }] } })
            ),
            Err(ServerError::Validation(ValidationError::TooManyRows { .. }))
        ));

        server
            .handle("loadContent", json!({ "content": encoded(&two_note_file()), "id": "two" }))
            .unwrap();
        assert!(matches!(
            server.handle(
                "convertToSong",
                json!({ "fileId": "two", "rowsPerPattern": 18446744073709551615u64 })
            ),
            Err(ServerError::Validation(ValidationError::TooManyRows { .. }))
        ));
        assert!(matches!(
            server.handle("convertToSong", json!({ "fileId": "two", "ticksPerBeat": 4294967295u32 })),
            Err(ServerError::Validation(ValidationError::ValueOutOfRange { .. }))
        ));
        let files = server.handle("listFiles", json!({})).unwrap();
        assert_eq!(files["files"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_disconnect_stops_playback() {
        let (ports, server) = server();
        server
            .handle(
                "loadTracker",
                json!({ "content": "#BPM: 60\nPATTERN 0 ROWS 1\n00 | C-4 .. .. S40 |", "id": "drone" }),
            )
            .unwrap();
        server.handle("playFile", json!({ "fileId": "drone" })).unwrap();
        thread::sleep(Duration::from_millis(30));

        let result = server.handle("disconnectPort", json!({})).unwrap();
        assert_eq!(result["stoppedSessions"], 1);
        assert_eq!(
            ports.events(),
            vec![MidiEvent::note_on(0, 48, 100), MidiEvent::note_off(0, 48)]
        );
        let status = server.handle("sessionStatus", json!({ "fileId": "drone" })).unwrap();
        assert_eq!(status["state"], "stopped");
    }

    #[test]
    fn test_unknown_method() {
        let (_ports, server) = server();
        assert!(matches!(
            server.handle("fs/readFile", json!({})),
            Err(ServerError::MethodNotFound(_))
        ));
        let info = server.handle("serverInfo", json!({})).unwrap();
        assert_eq!(info["name"], "midimcp");
        assert!(METHODS.iter().all(|m| m.name != "serverInfo" || m.params.is_empty()));
    }
}
