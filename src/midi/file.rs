//! Standard MIDI file parsing
//!
//! Loads `.mid` data and flattens it into a playable `Sequence`, keeping the
//! per-track note layout around for summaries and tracker conversion.

use std::collections::HashMap;
use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use serde::Serialize;

use super::events::{MidiEvent, ScheduledEvent};
use crate::error::FormatError;
use crate::playback::Sequence;

/// Default tempo when a file declares none (120 BPM)
const DEFAULT_US_PER_BEAT: f64 = 500_000.0;

/// Information about a single track in a MIDI file
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MidiTrackInfo {
    /// Track index (0-based)
    pub index: usize,
    /// Track name from MIDI meta event (if present)
    pub name: Option<String>,
    /// Number of note events in this track
    pub note_count: usize,
    /// Primary MIDI channel used (0-15), if consistent
    pub channel: Option<u8>,
    /// Duration in beats
    pub duration_beats: f64,
}

/// A tempo change event in a MIDI file
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TempoEvent {
    /// Position in beats where this tempo starts
    pub beat: f64,
    /// Tempo in BPM
    pub bpm: f64,
}

/// A note extracted from a MIDI file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiFileNote {
    /// Start, in file ticks
    pub tick: u64,
    /// Length in file ticks (at least 1)
    pub duration_ticks: u64,
    /// MIDI note number (0-127)
    pub note: u8,
    /// Velocity (1-127)
    pub velocity: u8,
    /// MIDI channel (0-15)
    pub channel: u8,
}

/// Converts file ticks to microseconds across tempo changes
#[derive(Debug, Clone)]
struct TempoMap {
    /// (tick, microseconds at that tick, microseconds per tick from there)
    segments: Vec<(u64, f64, f64)>,
}

impl TempoMap {
    fn metrical(ticks_per_beat: u16, mut changes: Vec<(u64, u32)>) -> Self {
        let tpb = ticks_per_beat.max(1) as f64;
        changes.sort_by_key(|(tick, _)| *tick);

        let mut segments = vec![(0u64, 0.0f64, DEFAULT_US_PER_BEAT / tpb)];
        for (tick, us_per_beat) in changes {
            let &(last_tick, last_us, last_rate) = segments.last().unwrap_or(&(0, 0.0, 0.0));
            let start_us = last_us + (tick - last_tick) as f64 * last_rate;
            let rate = us_per_beat as f64 / tpb;
            if tick == last_tick {
                // Later change at the same tick wins
                segments.pop();
            }
            segments.push((tick, start_us, rate));
        }
        Self { segments }
    }

    fn fixed(us_per_tick: f64) -> Self {
        Self {
            segments: vec![(0, 0.0, us_per_tick)],
        }
    }

    fn micros(&self, tick: u64) -> u64 {
        let idx = self.segments.partition_point(|(t, _, _)| *t <= tick);
        let (seg_tick, seg_us, rate) = self.segments[idx.saturating_sub(1)];
        (seg_us + (tick - seg_tick) as f64 * rate).round() as u64
    }
}

/// A parsed MIDI file with track information
#[derive(Debug, Clone)]
pub struct ParsedMidiFile {
    /// Display name
    pub name: String,
    /// Ticks per beat (from MIDI header, approximated for SMPTE timing)
    pub ticks_per_beat: u16,
    /// Initial BPM (tempo at beat 0)
    pub bpm: f64,
    /// Tempo map (always has at least one entry at beat 0)
    pub tempo_map: Vec<TempoEvent>,
    /// Track information
    pub tracks: Vec<MidiTrackInfo>,
    /// Notes for each entry of `tracks`
    pub track_notes: Vec<Vec<MidiFileNote>>,
    /// Flattened, timed events
    pub sequence: Sequence,
}

impl ParsedMidiFile {
    /// Get notes for a specific track
    pub fn get_track_notes(&self, track_index: usize) -> Option<&[MidiFileNote]> {
        self.track_notes.get(track_index).map(|v| v.as_slice())
    }

    /// Check if the file has tempo automation (more than one tempo event)
    pub fn has_tempo_automation(&self) -> bool {
        self.tempo_map.len() > 1
    }

    /// Every note in the file, ordered by start tick
    pub fn all_notes(&self) -> Vec<MidiFileNote> {
        let mut notes: Vec<MidiFileNote> = self.track_notes.iter().flatten().copied().collect();
        notes.sort_by_key(|n| (n.tick, n.channel));
        notes
    }

    pub fn info(&self) -> MidiFileInfo {
        let duration_beats = self
            .tracks
            .iter()
            .map(|t| t.duration_beats)
            .fold(0.0, f64::max);

        MidiFileInfo {
            filename: self.name.clone(),
            bpm: self.bpm,
            duration_beats,
            duration_ms: self.sequence.duration_us() as f64 / 1000.0,
            event_count: self.sequence.len(),
            tracks: self.tracks.clone(),
            tempo_map: self.tempo_map.clone(),
            has_tempo_automation: self.has_tempo_automation(),
        }
    }
}

/// Summary of a loaded MIDI file returned to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MidiFileInfo {
    /// File name (without path)
    pub filename: String,
    /// Default BPM from file
    pub bpm: f64,
    /// Total duration in beats (longest track)
    pub duration_beats: f64,
    /// Duration in milliseconds, tempo map applied
    pub duration_ms: f64,
    pub event_count: usize,
    /// Track information
    pub tracks: Vec<MidiTrackInfo>,
    /// Tempo map for automation
    pub tempo_map: Vec<TempoEvent>,
    /// Whether the file has tempo changes
    pub has_tempo_automation: bool,
}

/// Parse Standard MIDI File data
pub fn parse_midi_bytes(data: &[u8], name: &str) -> Result<ParsedMidiFile, FormatError> {
    let smf = Smf::parse(data)
        .map_err(|e| FormatError::MalformedFile(format!("Failed to parse MIDI file: {}", e)))?;

    if smf.header.format == Format::Sequential {
        return Err(FormatError::UnsupportedEvent(
            "sequential (format 2) MIDI files are not supported".to_string(),
        ));
    }

    // Collect ALL tempo events from all tracks to build tempo map
    let mut tempo_changes: Vec<(u64, u32)> = Vec::new();
    for track in &smf.tracks {
        let mut current_tick: u64 = 0;
        for event in track {
            current_tick += event.delta.as_int() as u64;
            if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                tempo_changes.push((current_tick, tempo.as_int()));
            }
        }
    }
    tempo_changes.sort_by_key(|(tick, _)| *tick);

    let (ticks_per_beat, timing) = match smf.header.timing {
        Timing::Metrical(tpb) => {
            let tpb = tpb.as_int().max(1);
            (tpb, TempoMap::metrical(tpb, tempo_changes.clone()))
        }
        Timing::Timecode(fps, tpf) => {
            let ticks_per_second = (fps.as_f32() * tpf as f32).max(1.0) as f64;
            // Rough beat grid assuming 120 BPM, only used for beat summaries
            let tpb = (ticks_per_second / 2.0).max(1.0) as u16;
            (tpb, TempoMap::fixed(1_000_000.0 / ticks_per_second))
        }
    };

    let mut tempo_map: Vec<TempoEvent> = tempo_changes
        .iter()
        .map(|&(tick, us)| TempoEvent {
            beat: tick as f64 / ticks_per_beat as f64,
            bpm: 60_000_000.0 / us.max(1) as f64,
        })
        .collect();
    if tempo_map.is_empty() || tempo_map[0].beat > 0.0 {
        tempo_map.insert(0, TempoEvent { beat: 0.0, bpm: 120.0 });
    }
    let bpm = tempo_map[0].bpm;

    let mut all_track_data: Vec<(usize, Option<String>, Vec<MidiFileNote>)> = Vec::new();
    let mut scheduled: Vec<ScheduledEvent> = Vec::new();

    for (track_idx, track) in smf.tracks.iter().enumerate() {
        let mut track_name: Option<String> = None;
        let mut notes: Vec<MidiFileNote> = Vec::new();
        let mut active_notes: HashMap<(u8, u8), (u64, u8)> = HashMap::new();
        let mut current_tick: u64 = 0;

        let close_note = |notes: &mut Vec<MidiFileNote>, ch: u8, note: u8, start: u64, vel: u8, end: u64| {
            notes.push(MidiFileNote {
                tick: start,
                duration_ticks: end.saturating_sub(start).max(1),
                note,
                velocity: vel,
                channel: ch,
            });
        };

        for event in track {
            current_tick += event.delta.as_int() as u64;

            match event.kind {
                TrackEventKind::Meta(MetaMessage::TrackName(name_bytes)) => {
                    if let Ok(name) = std::str::from_utf8(name_bytes) {
                        track_name = Some(name.to_string());
                    }
                }
                TrackEventKind::Midi { channel, message } => {
                    let ch = channel.as_int();

                    match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            let note = key.as_int();
                            // A repeated note on at the same tick is the same note
                            if matches!(active_notes.get(&(ch, note)), Some(&(start, _)) if start == current_tick) {
                                continue;
                            }
                            // Retrigger without note off ends the earlier note here
                            if let Some((start, v)) = active_notes.remove(&(ch, note)) {
                                close_note(&mut notes, ch, note, start, v, current_tick);
                            }
                            active_notes.insert((ch, note), (current_tick, vel.as_int()));
                        }
                        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                            let note = key.as_int();
                            if let Some((start, v)) = active_notes.remove(&(ch, note)) {
                                close_note(&mut notes, ch, note, start, v, current_tick);
                            }
                        }
                        MidiMessage::Controller { controller, value } => {
                            scheduled.push(ScheduledEvent::new(
                                timing.micros(current_tick),
                                MidiEvent::control_change(ch, controller.as_int(), value.as_int()),
                            ));
                        }
                        MidiMessage::ProgramChange { program } => {
                            scheduled.push(ScheduledEvent::new(
                                timing.micros(current_tick),
                                MidiEvent::program_change(ch, program.as_int()),
                            ));
                        }
                        MidiMessage::PitchBend { bend } => {
                            scheduled.push(ScheduledEvent::new(
                                timing.micros(current_tick),
                                MidiEvent::pitch_bend(ch, bend.0.as_int()),
                            ));
                        }
                        _ => {
                            log::trace!("Skipping MIDI message at tick {}: {:?}", current_tick, message);
                        }
                    }
                }
                _ => {}
            }
        }

        // Close any remaining active notes at track end
        for ((ch, note), (start, vel)) in active_notes {
            close_note(&mut notes, ch, note, start, vel, current_tick);
        }
        notes.sort_by_key(|n| (n.tick, n.channel, n.note));

        for n in &notes {
            scheduled.push(ScheduledEvent::new(
                timing.micros(n.tick),
                MidiEvent::note_on(n.channel, n.note, n.velocity),
            ));
            scheduled.push(ScheduledEvent::new(
                timing.micros(n.tick + n.duration_ticks),
                MidiEvent::note_off(n.channel, n.note),
            ));
        }

        if !notes.is_empty() {
            all_track_data.push((track_idx, track_name, notes));
        }
    }

    if scheduled.is_empty() {
        return Err(FormatError::MalformedFile(
            "MIDI file contains no channel events".to_string(),
        ));
    }

    let (tracks, track_notes) = split_tracks(all_track_data, ticks_per_beat);

    Ok(ParsedMidiFile {
        name: name.to_string(),
        ticks_per_beat,
        bpm,
        tempo_map,
        tracks,
        track_notes,
        sequence: Sequence::new(scheduled),
    })
}

/// Split tracks that use several channels into one virtual track per channel,
/// ordered by channel.
fn split_tracks(
    all_track_data: Vec<(usize, Option<String>, Vec<MidiFileNote>)>,
    ticks_per_beat: u16,
) -> (Vec<MidiTrackInfo>, Vec<Vec<MidiFileNote>>) {
    let tpb = ticks_per_beat.max(1) as f64;
    let duration_beats = |notes: &[MidiFileNote]| {
        notes
            .iter()
            .map(|n| (n.tick + n.duration_ticks) as f64 / tpb)
            .fold(0.0, f64::max)
    };

    let mut combined: Vec<(MidiTrackInfo, Vec<MidiFileNote>)> = Vec::new();

    for (orig_idx, track_name, notes) in all_track_data {
        let mut channels: Vec<u8> = notes.iter().map(|n| n.channel).collect();
        channels.sort_unstable();
        channels.dedup();

        if channels.len() <= 1 {
            combined.push((
                MidiTrackInfo {
                    index: orig_idx,
                    name: track_name,
                    note_count: notes.len(),
                    channel: channels.first().copied(),
                    duration_beats: duration_beats(&notes),
                },
                notes,
            ));
            continue;
        }

        for ch in channels {
            let ch_notes: Vec<MidiFileNote> =
                notes.iter().filter(|n| n.channel == ch).copied().collect();

            // GM standard name for the percussion channel
            let ch_name = match ch {
                9 => "Drums".to_string(),
                _ => format!("Channel {}", ch + 1),
            };

            combined.push((
                MidiTrackInfo {
                    index: orig_idx,
                    name: Some(ch_name),
                    note_count: ch_notes.len(),
                    channel: Some(ch),
                    duration_beats: duration_beats(&ch_notes),
                },
                ch_notes,
            ));
        }
    }

    combined.sort_by_key(|(info, _)| info.channel.unwrap_or(255));
    combined.into_iter().unzip()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a format-0/1 SMF from raw track chunks
    pub(crate) fn smf(format: u16, ticks_per_beat: u16, tracks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = b"MThd".to_vec();
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&format.to_be_bytes());
        out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&ticks_per_beat.to_be_bytes());
        for track in tracks {
            out.extend_from_slice(b"MTrk");
            let mut body = track.clone();
            body.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            out.extend_from_slice(&body);
        }
        out
    }

    /// One track at 96 tpb: C4 for a beat, then D4 for a beat
    pub(crate) fn two_note_file() -> Vec<u8> {
        smf(
            0,
            96,
            &[vec![
                0x00, 0x90, 60, 100, // C4 on
                0x60, 0x80, 60, 0, // off after 96 ticks
                0x00, 0x90, 62, 90, // D4 on
                0x60, 0x90, 62, 0, // off via zero velocity
            ]],
        )
    }

    #[test]
    fn test_tempo_calculation() {
        // 500000 microseconds per beat = 120 BPM
        let bpm: f64 = 60_000_000.0 / 500_000.0;
        assert!((bpm - 120.0).abs() < 0.01);

        // 600000 microseconds per beat = 100 BPM
        let bpm: f64 = 60_000_000.0 / 600_000.0;
        assert!((bpm - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_parse_notes_default_tempo() {
        let parsed = parse_midi_bytes(&two_note_file(), "two.mid").unwrap();
        assert_eq!(parsed.ticks_per_beat, 96);
        assert!((parsed.bpm - 120.0).abs() < f64::EPSILON);
        assert_eq!(parsed.tracks.len(), 1);
        assert_eq!(parsed.tracks[0].note_count, 2);
        assert_eq!(parsed.tracks[0].channel, Some(0));

        let events: Vec<_> = parsed
            .sequence
            .events()
            .iter()
            .map(|e| (e.offset_us, e.event))
            .collect();
        assert_eq!(
            events,
            vec![
                (0, MidiEvent::note_on(0, 60, 100)),
                (500_000, MidiEvent::note_off(0, 60)),
                (500_000, MidiEvent::note_on(0, 62, 90)),
                (1_000_000, MidiEvent::note_off(0, 62)),
            ]
        );
    }

    #[test]
    fn test_tempo_change_applies_from_its_tick() {
        let data = smf(
            1,
            100,
            &[
                // Tempo track: 60 BPM at 0, 120 BPM at tick 100
                vec![
                    0x00, 0xFF, 0x51, 0x03, 0x0F, 0x42, 0x40, // 1_000_000 us/beat
                    0x64, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, // 500_000 us/beat
                ],
                vec![
                    0x00, 0x91, 64, 80, //
                    0x81, 0x48, 0x81, 64, 0, // off at tick 200
                ],
            ],
        );
        let parsed = parse_midi_bytes(&data, "tempo.mid").unwrap();
        assert!(parsed.has_tempo_automation());
        assert!((parsed.bpm - 60.0).abs() < 0.001);

        let off = parsed.sequence.events().last().unwrap();
        // 100 ticks at 1s/beat + 100 ticks at 0.5s/beat
        assert_eq!(off.offset_us, 1_500_000);
        assert_eq!(off.event, MidiEvent::note_off(1, 64));
    }

    #[test]
    fn test_controls_and_unclosed_notes() {
        let data = smf(
            0,
            96,
            &[vec![
                0x00, 0xC2, 5, // program change ch 2
                0x00, 0xB2, 7, 100, // volume
                0x00, 0x92, 48, 70, // never closed
                0x30, 0xE2, 0x00, 0x40, // pitch bend center
            ]],
        );
        let parsed = parse_midi_bytes(&data, "ctl.mid").unwrap();
        let events: Vec<_> = parsed.sequence.events().iter().map(|e| e.event).collect();
        assert_eq!(events[0], MidiEvent::program_change(2, 5));
        assert_eq!(events[1], MidiEvent::control_change(2, 7, 100));
        assert_eq!(events[2], MidiEvent::note_on(2, 48, 70));
        // Unclosed note ends at track end, ahead of the bend sharing its tick
        let tail = &parsed.sequence.events()[3..];
        assert_eq!(tail[0].offset_us, 250_000);
        assert_eq!(tail[0].event, MidiEvent::note_off(2, 48));
        assert_eq!(tail[1].event, MidiEvent::pitch_bend(2, 8192));
    }

    #[test]
    fn test_same_tick_retrigger_is_one_note() {
        let data = smf(
            0,
            96,
            &[vec![
                0x00, 0x90, 60, 100, //
                0x00, 0x90, 60, 80, // duplicate at tick 0
                0x60, 0x80, 60, 0, //
                0x00, 0x80, 60, 0, // stray second off
            ]],
        );
        let parsed = parse_midi_bytes(&data, "dup.mid").unwrap();
        let events: Vec<_> = parsed
            .sequence
            .events()
            .iter()
            .map(|e| (e.offset_us, e.event))
            .collect();
        assert_eq!(
            events,
            vec![
                (0, MidiEvent::note_on(0, 60, 100)),
                (500_000, MidiEvent::note_off(0, 60)),
            ]
        );
    }

    #[test]
    fn test_multichannel_track_is_split() {
        let data = smf(
            0,
            96,
            &[vec![
                0x00, 0x99, 36, 100, //
                0x00, 0x90, 60, 100, //
                0x60, 0x89, 36, 0, //
                0x00, 0x80, 60, 0,
            ]],
        );
        let parsed = parse_midi_bytes(&data, "split.mid").unwrap();
        assert_eq!(parsed.tracks.len(), 2);
        assert_eq!(parsed.tracks[0].channel, Some(0));
        assert_eq!(parsed.tracks[1].name.as_deref(), Some("Drums"));
        assert_eq!(parsed.get_track_notes(1).unwrap()[0].note, 36);
    }

    #[test]
    fn test_rejects_garbage_and_empty() {
        assert!(matches!(
            parse_midi_bytes(b"not a midi file", "x.mid"),
            Err(FormatError::MalformedFile(_))
        ));
        let empty = smf(0, 96, &[vec![]]);
        assert!(matches!(
            parse_midi_bytes(&empty, "empty.mid"),
            Err(FormatError::MalformedFile(_))
        ));
    }

    #[test]
    fn test_rejects_sequential_format() {
        let data = smf(2, 96, &[vec![0x00, 0x90, 60, 100, 0x10, 0x80, 60, 0]]);
        assert!(matches!(
            parse_midi_bytes(&data, "seq.mid"),
            Err(FormatError::UnsupportedEvent(_))
        ));
    }

    #[test]
    fn test_info_summary() {
        let parsed = parse_midi_bytes(&two_note_file(), "two.mid").unwrap();
        let info = parsed.info();
        assert_eq!(info.filename, "two.mid");
        assert_eq!(info.event_count, 4);
        assert!((info.duration_ms - 1000.0).abs() < 0.001);
        assert!((info.duration_beats - 2.0).abs() < 0.001);
    }
}
