//! Quantize a parsed MIDI file onto a tracker grid

use std::collections::HashMap;

use serde::Serialize;

use super::model::{Cell, Pattern, Tracker, MAX_ROWS_PER_PATTERN, MAX_SONG_ROWS};
use crate::error::ValidationError;
use crate::midi::file::ParsedMidiFile;
use crate::midi::MidiEvent;

pub const DEFAULT_ROWS_PER_PATTERN: usize = 64;
/// Finest grid a conversion accepts, in rows per beat
pub const MAX_TICKS_PER_BEAT: u32 = 960;

/// Grid settings for a conversion
#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    /// Rows per beat (one tick per row)
    pub ticks_per_beat: u32,
    pub rows_per_pattern: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            ticks_per_beat: 4,
            rows_per_pattern: DEFAULT_ROWS_PER_PATTERN,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResult {
    pub tracker: Tracker,
    /// Notes that landed on a cell already holding a note
    pub dropped_notes: usize,
}

/// Convert a MIDI file to a tracker song.
///
/// Channels map one to one. Each note starts on its nearest row and keeps its
/// quantized length as a sustain. Only the first tempo is kept.
pub fn midi_to_tracker(
    file: &ParsedMidiFile,
    options: ConvertOptions,
) -> Result<ConversionResult, ValidationError> {
    if options.ticks_per_beat == 0 || options.rows_per_pattern == 0 {
        return Err(ValidationError::ResolutionNonPositive);
    }
    if options.ticks_per_beat > MAX_TICKS_PER_BEAT {
        return Err(ValidationError::ValueOutOfRange {
            field: "ticksPerBeat",
            value: options.ticks_per_beat,
            max: MAX_TICKS_PER_BEAT,
        });
    }
    if options.rows_per_pattern > MAX_ROWS_PER_PATTERN {
        return Err(ValidationError::TooManyRows {
            what: "pattern",
            rows: options.rows_per_pattern,
            max: MAX_ROWS_PER_PATTERN,
        });
    }

    let file_ticks_per_row = file.ticks_per_beat.max(1) as f64 / options.ticks_per_beat as f64;
    let to_rows = |ticks: u64| (ticks as f64 / file_ticks_per_row).round() as usize;

    // First program per channel, attached to that channel's first note
    let mut programs: HashMap<u8, u8> = HashMap::new();
    for e in file.sequence.events() {
        if let MidiEvent::ProgramChange { channel, program } = e.event {
            programs.entry(channel).or_insert(program);
        }
    }

    let notes = file.all_notes();
    let total_rows = notes
        .iter()
        .map(|n| to_rows(n.tick).saturating_add(1))
        .max()
        .unwrap_or(1);
    if total_rows > MAX_SONG_ROWS {
        return Err(ValidationError::TooManyRows {
            what: "song",
            rows: total_rows,
            max: MAX_SONG_ROWS,
        });
    }

    let rpp = options.rows_per_pattern;
    let pattern_count = total_rows.div_ceil(rpp);
    let mut patterns: Vec<Pattern> = (0..pattern_count)
        .map(|i| Pattern::new(i, rpp.min(total_rows - i * rpp)))
        .collect();

    let mut dropped_notes = 0;
    for n in notes {
        let row = to_rows(n.tick);
        let channel = n.channel as usize;
        let slot = &mut patterns[row / rpp].rows[row % rpp];

        if slot.get(channel).map_or(false, |c| c.note.is_some()) {
            dropped_notes += 1;
            continue;
        }

        let length = to_rows(n.duration_ticks).max(1) as u32;
        let mut cell = Cell::note(n.note).with_velocity(n.velocity);
        if length != 1 {
            cell = cell.with_sustain(length);
        }
        if let Some(program) = programs.remove(&n.channel) {
            cell = cell.with_instrument(program);
        }
        slot.set(channel, cell);
    }

    if dropped_notes > 0 {
        log::info!(
            "Converted {} with {} overlapping notes dropped",
            file.name,
            dropped_notes
        );
    }

    Ok(ConversionResult {
        tracker: Tracker {
            title: file.name.clone(),
            bpm: file.bpm,
            ticks_per_beat: options.ticks_per_beat,
            ticks_per_row: 1,
            patterns,
            order: Vec::new(),
        },
        dropped_notes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::file::parse_midi_bytes;
    use crate::midi::file::tests::{smf, two_note_file};
    use crate::tracker::model::NoteCommand;

    #[test]
    fn test_converted_song_plays_like_the_file() {
        let file = parse_midi_bytes(&two_note_file(), "two.mid").unwrap();
        let result = midi_to_tracker(&file, ConvertOptions::default()).unwrap();
        assert_eq!(result.dropped_notes, 0);

        let tracker = &result.tracker;
        assert_eq!(tracker.patterns.len(), 1);
        assert_eq!(tracker.patterns[0].rows.len(), 5);
        let first = tracker.patterns[0].rows[0].get(0).unwrap();
        assert_eq!(first.note, Some(NoteCommand::Play(60)));
        assert_eq!(first.sustain, Some(4));

        let compiled = tracker.compile().unwrap();
        assert_eq!(compiled.events(), file.sequence.events());
    }

    #[test]
    fn test_chords_drop_extra_notes() {
        let data = smf(
            0,
            96,
            &[vec![
                0x00, 0xC0, 0x05, // program 5
                0x00, 0x90, 60, 100, //
                0x00, 0x90, 64, 100, // same row, same channel
                0x00, 0x91, 67, 100, // other channel survives
                0x60, 0x80, 60, 0, //
                0x00, 0x80, 64, 0, //
                0x00, 0x81, 67, 0,
            ]],
        );
        let file = parse_midi_bytes(&data, "chord.mid").unwrap();
        let result = midi_to_tracker(&file, ConvertOptions::default()).unwrap();
        assert_eq!(result.dropped_notes, 1);

        let row = &result.tracker.patterns[0].rows[0];
        assert_eq!(row.get(0).unwrap().note, Some(NoteCommand::Play(60)));
        assert_eq!(row.get(0).unwrap().instrument, Some(5));
        assert_eq!(row.get(1).unwrap().note, Some(NoteCommand::Play(67)));
    }

    #[test]
    fn test_long_files_span_patterns() {
        let file = parse_midi_bytes(&two_note_file(), "two.mid").unwrap();
        let options = ConvertOptions {
            ticks_per_beat: 4,
            rows_per_pattern: 2,
        };
        let tracker = midi_to_tracker(&file, options).unwrap().tracker;
        let sizes: Vec<_> = tracker.patterns.iter().map(|p| p.rows.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(tracker.patterns[2].rows[0].get(0).is_some());

        let bad = ConvertOptions {
            ticks_per_beat: 0,
            rows_per_pattern: 2,
        };
        assert_eq!(
            midi_to_tracker(&file, bad).unwrap_err(),
            ValidationError::ResolutionNonPositive
        );
    }

    #[test]
    fn test_grid_limits_are_enforced() {
        let file = parse_midi_bytes(&two_note_file(), "two.mid").unwrap();

        let huge_patterns = ConvertOptions {
            ticks_per_beat: 4,
            rows_per_pattern: usize::MAX,
        };
        assert!(matches!(
            midi_to_tracker(&file, huge_patterns),
            Err(ValidationError::TooManyRows { what: "pattern", .. })
        ));

        let fine_grid = ConvertOptions {
            ticks_per_beat: u32::MAX,
            rows_per_pattern: 64,
        };
        assert!(matches!(
            midi_to_tracker(&file, fine_grid),
            Err(ValidationError::ValueOutOfRange { field: "ticksPerBeat", .. })
        ));

        // A note 2^21 beats in lands far past the song limit
        let late = smf(
            0,
            1,
            &[vec![
                0x81, 0x80, 0x80, 0x00, 0x90, 60, 100, // delta 2^21 ticks
                0x01, 0x80, 60, 0,
            ]],
        );
        let file = parse_midi_bytes(&late, "late.mid").unwrap();
        let dense = ConvertOptions {
            ticks_per_beat: MAX_TICKS_PER_BEAT,
            rows_per_pattern: MAX_ROWS_PER_PATTERN,
        };
        assert!(matches!(
            midi_to_tracker(&file, dense),
            Err(ValidationError::TooManyRows { what: "song", .. })
        ));
    }
}
