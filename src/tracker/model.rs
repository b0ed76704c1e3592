//! Pattern-based composition model and its compilation to a `Sequence`

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::midi::{MidiEvent, ScheduledEvent};
use crate::playback::Sequence;

/// Channels a row may address (one per MIDI channel)
pub const MAX_CHANNELS: usize = 16;
/// Velocity used when a cell leaves it blank
pub const DEFAULT_VELOCITY: u8 = 100;
/// Longest pattern accepted from any source
pub const MAX_ROWS_PER_PATTERN: usize = 1024;
/// Longest song accepted, in rows across all patterns or the play order
pub const MAX_SONG_ROWS: usize = 65_536;

/// What a cell does to the note on its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteCommand {
    /// Start a note (MIDI note number)
    Play(u8),
    /// Silence whatever the channel is playing
    Cut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlValue {
    pub controller: u8,
    pub value: u8,
}

/// One channel slot of a row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cell {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<NoteCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<u8>,
    /// Program number; a change on the channel emits a program change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub controls: Vec<ControlValue>,
    /// Note length in ticks, overriding the row length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sustain: Option<u32>,
}

impl Cell {
    pub fn note(note: u8) -> Self {
        Self {
            note: Some(NoteCommand::Play(note)),
            ..Default::default()
        }
    }

    pub fn cut() -> Self {
        Self {
            note: Some(NoteCommand::Cut),
            ..Default::default()
        }
    }

    pub fn with_velocity(mut self, velocity: u8) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn with_instrument(mut self, instrument: u8) -> Self {
        self.instrument = Some(instrument);
        self
    }

    pub fn with_sustain(mut self, ticks: u32) -> Self {
        self.sustain = Some(ticks);
        self
    }

    pub fn with_control(mut self, controller: u8, value: u8) -> Self {
        self.controls.push(ControlValue { controller, value });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.note.is_none()
            && self.instrument.is_none()
            && self.controls.is_empty()
            && self.velocity.is_none()
            && self.sustain.is_none()
    }
}

/// One tick-slice of a pattern; index is the channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    pub cells: Vec<Option<Cell>>,
}

impl Row {
    pub fn set(&mut self, channel: usize, cell: Cell) {
        if self.cells.len() <= channel {
            self.cells.resize(channel + 1, None);
        }
        self.cells[channel] = Some(cell);
    }

    pub fn get(&self, channel: usize) -> Option<&Cell> {
        self.cells.get(channel).and_then(|c| c.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(|c| c.as_ref().map_or(true, Cell::is_empty))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    /// Identifier referenced by the play order
    pub index: usize,
    pub rows: Vec<Row>,
}

impl Pattern {
    pub fn new(index: usize, rows: usize) -> Self {
        Self {
            index,
            rows: vec![Row::default(); rows],
        }
    }

    /// Channels used by any row
    pub fn channel_count(&self) -> usize {
        self.rows.iter().map(|r| r.cells.len()).max().unwrap_or(0)
    }
}

fn default_bpm() -> f64 {
    120.0
}

fn default_ticks_per_beat() -> u32 {
    4
}

fn default_ticks_per_row() -> u32 {
    1
}

/// A complete tracker song
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracker {
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    #[serde(default = "default_ticks_per_beat")]
    pub ticks_per_beat: u32,
    #[serde(default = "default_ticks_per_row")]
    pub ticks_per_row: u32,
    pub patterns: Vec<Pattern>,
    /// Pattern play order by index; empty plays patterns as declared
    #[serde(default)]
    pub order: Vec<usize>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            title: String::new(),
            bpm: default_bpm(),
            ticks_per_beat: default_ticks_per_beat(),
            ticks_per_row: default_ticks_per_row(),
            patterns: Vec::new(),
            order: Vec::new(),
        }
    }
}

impl Tracker {
    pub fn pattern(&self, index: usize) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.index == index)
    }

    /// Wall-clock length of one tick in microseconds
    pub fn us_per_tick(&self) -> f64 {
        60_000_000.0 / (self.bpm * self.ticks_per_beat as f64)
    }

    /// Reject anything that cannot be compiled
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(ValidationError::TempoNonPositive(self.bpm.to_string()));
        }
        if self.ticks_per_beat == 0 || self.ticks_per_row == 0 {
            return Err(ValidationError::ResolutionNonPositive);
        }
        for &index in &self.order {
            if self.pattern(index).is_none() {
                return Err(ValidationError::UnknownPattern(index));
            }
        }

        let mut declared = 0usize;
        for pattern in &self.patterns {
            if pattern.rows.len() > MAX_ROWS_PER_PATTERN {
                return Err(ValidationError::TooManyRows {
                    what: "pattern",
                    rows: pattern.rows.len(),
                    max: MAX_ROWS_PER_PATTERN,
                });
            }
            declared += pattern.rows.len();
        }
        let ordered = self
            .play_order()
            .iter()
            .fold(0usize, |sum, p| sum.saturating_add(p.rows.len()));
        let song_rows = declared.max(ordered);
        if song_rows > MAX_SONG_ROWS {
            return Err(ValidationError::TooManyRows {
                what: "song",
                rows: song_rows,
                max: MAX_SONG_ROWS,
            });
        }

        for pattern in &self.patterns {
            for row in &pattern.rows {
                if row.cells.len() > MAX_CHANNELS {
                    return Err(ValidationError::ChannelOutOfRange(row.cells.len() - 1));
                }
                for cell in row.cells.iter().flatten() {
                    if let Some(NoteCommand::Play(note)) = cell.note {
                        ValidationError::check_data("note", note as u32)?;
                    }
                    if let Some(velocity) = cell.velocity {
                        ValidationError::check_data("velocity", velocity as u32)?;
                    }
                    if let Some(instrument) = cell.instrument {
                        ValidationError::check_data("instrument", instrument as u32)?;
                    }
                    for c in &cell.controls {
                        ValidationError::check_data("controller", c.controller as u32)?;
                        ValidationError::check_data("value", c.value as u32)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Patterns in play order
    pub fn play_order(&self) -> Vec<&Pattern> {
        if self.order.is_empty() {
            self.patterns.iter().collect()
        } else {
            self.order.iter().filter_map(|&i| self.pattern(i)).collect()
        }
    }

    /// Total ticks across the play order
    pub fn total_ticks(&self) -> u64 {
        self.play_order()
            .iter()
            .map(|p| p.rows.len() as u64 * self.ticks_per_row as u64)
            .sum()
    }

    /// Compile into a flat, ordered `Sequence`.
    ///
    /// Each channel is monophonic: a new note or cut ends the channel's
    /// previous note no later than the new row's start.
    pub fn compile(&self) -> Result<Sequence, ValidationError> {
        self.validate()?;

        let us_per_tick = self.us_per_tick();
        let at = |tick: u64| (tick as f64 * us_per_tick).round() as u64;
        let row_ticks = self.ticks_per_row as u64;

        let mut events: Vec<ScheduledEvent> = Vec::new();
        // channel -> (note, off tick)
        let mut sounding: HashMap<usize, (u8, u64)> = HashMap::new();
        // channel -> last program sent
        let mut programs: HashMap<usize, u8> = HashMap::new();

        let end_note = |events: &mut Vec<ScheduledEvent>, channel: usize, note: u8, tick: u64| {
            events.push(ScheduledEvent::new(
                at(tick),
                MidiEvent::note_off(channel as u8, note),
            ));
        };

        let mut pattern_start: u64 = 0;
        for pattern in self.play_order() {
            for (r, row) in pattern.rows.iter().enumerate() {
                let row_tick = pattern_start + r as u64 * row_ticks;

                for (channel, cell) in row.cells.iter().enumerate() {
                    let Some(cell) = cell else { continue };
                    let ch = channel as u8;

                    if let Some(program) = cell.instrument {
                        if programs.get(&channel) != Some(&program) {
                            programs.insert(channel, program);
                            events.push(ScheduledEvent::new(
                                at(row_tick),
                                MidiEvent::program_change(ch, program),
                            ));
                        }
                    }

                    for c in &cell.controls {
                        events.push(ScheduledEvent::new(
                            at(row_tick),
                            MidiEvent::control_change(ch, c.controller, c.value),
                        ));
                    }

                    let Some(command) = cell.note else { continue };
                    if let Some((note, off_tick)) = sounding.remove(&channel) {
                        end_note(&mut events, channel, note, off_tick.min(row_tick));
                    }
                    if let NoteCommand::Play(note) = command {
                        let velocity = cell.velocity.unwrap_or(DEFAULT_VELOCITY);
                        let sustain = cell.sustain.map(|s| s.max(1) as u64).unwrap_or(row_ticks);
                        events.push(ScheduledEvent::new(
                            at(row_tick),
                            MidiEvent::note_on(ch, note, velocity),
                        ));
                        sounding.insert(channel, (note, row_tick + sustain));
                    }
                }
            }
            pattern_start += pattern.rows.len() as u64 * row_ticks;
        }

        let mut remaining: Vec<_> = sounding.into_iter().collect();
        remaining.sort_unstable_by_key(|(channel, _)| *channel);
        for (channel, (note, off_tick)) in remaining {
            end_note(&mut events, channel, note, off_tick);
        }

        Ok(Sequence::new(events))
    }
}
