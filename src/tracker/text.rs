//! Plain-text tracker format
//!
//! ```text
//! #TITLE: Demo
//! #BPM: 120
//! #TPB: 4
//! #SPEED: 1
//! #SEQUENCE: 0,0,1
//!
//! PATTERN 0 ROWS 16
//! 00 | C-4 01 100 | ... .. .. | E-3 .. 80 S4 C7=90
//! 04 | === .. ..  |
//! ```
//!
//! One `|`-separated cell per channel: note, instrument, velocity, then
//! effects (`S<ticks>` sustain, `C<controller>=<value>`).

use super::model::{
    Cell, ControlValue, NoteCommand, Pattern, Tracker, MAX_ROWS_PER_PATTERN, MAX_SONG_ROWS,
};
use crate::error::FormatError;

const NOTE_NAMES: [&str; 12] = [
    "C-", "C#", "D-", "D#", "E-", "F-", "F#", "G-", "G#", "A-", "A#", "B-",
];

/// Rows in a pattern that does not say
const DEFAULT_ROWS: usize = 64;

fn malformed(line: usize, msg: impl std::fmt::Display) -> FormatError {
    FormatError::MalformedFile(format!("line {}: {}", line, msg))
}

/// Parse a note token (`C-4`, `F#2`, `...`, `===`) into a command
pub fn parse_note(token: &str) -> Result<Option<NoteCommand>, String> {
    let token = token.to_uppercase();
    match token.as_str() {
        "..." | "---" => return Ok(None),
        "===" | "OFF" | "^^^" => return Ok(Some(NoteCommand::Cut)),
        _ => {}
    }

    if token.len() < 3 || !token.is_char_boundary(2) {
        return Err(format!("invalid note '{}'", token));
    }
    let (name, octave) = token.split_at(2);
    let semitone = NOTE_NAMES
        .iter()
        .position(|n| *n == name)
        .ok_or_else(|| format!("invalid note name '{}'", name))?;
    let octave: u32 = octave
        .parse()
        .map_err(|_| format!("invalid octave in '{}'", token))?;

    let note = semitone as u32 + octave * 12;
    if note > 127 {
        return Err(format!("note '{}' out of MIDI range", token));
    }
    Ok(Some(NoteCommand::Play(note as u8)))
}

/// Render a MIDI note number as a tracker note (`C-4`)
pub fn note_name(note: u8) -> String {
    format!("{}{}", NOTE_NAMES[(note % 12) as usize], note / 12)
}

fn parse_optional(token: Option<&str>, what: &str) -> Result<Option<u8>, String> {
    match token {
        None | Some("..") | Some("...") => Ok(None),
        Some(t) => t
            .parse::<u8>()
            .map(Some)
            .map_err(|_| format!("invalid {} '{}'", what, t)),
    }
}

fn parse_cell(text: &str) -> Result<Option<Cell>, String> {
    let mut tokens = text.split_whitespace();
    let Some(note) = tokens.next() else {
        return Ok(None);
    };

    let mut cell = Cell {
        note: parse_note(note)?,
        instrument: parse_optional(tokens.next(), "instrument")?,
        velocity: parse_optional(tokens.next(), "velocity")?,
        ..Default::default()
    };

    for effect in tokens {
        if let Some(ticks) = effect.strip_prefix('S') {
            let ticks = ticks
                .parse()
                .map_err(|_| format!("invalid sustain '{}'", effect))?;
            cell.sustain = Some(ticks);
        } else if let Some(assign) = effect.strip_prefix('C') {
            let (controller, value) = assign
                .split_once('=')
                .ok_or_else(|| format!("invalid control '{}'", effect))?;
            let controller = controller
                .parse()
                .map_err(|_| format!("invalid controller in '{}'", effect))?;
            let value = value
                .parse()
                .map_err(|_| format!("invalid control value in '{}'", effect))?;
            cell.controls.push(ControlValue { controller, value });
        } else {
            return Err(format!("unknown effect '{}'", effect));
        }
    }

    Ok(if cell.is_empty() { None } else { Some(cell) })
}

/// Parse tracker text into a `Tracker`. Pattern sizes are capped here,
/// other range checks are left to `Tracker::validate`.
pub fn parse_tracker(text: &str) -> Result<Tracker, FormatError> {
    let mut tracker = Tracker::default();
    let mut current: Option<usize> = None;
    let mut next_row = 0usize;
    let mut declared_rows = 0usize;

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with("//") || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('#') {
            let Some((key, value)) = header.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_uppercase().as_str() {
                "TITLE" => tracker.title = value.to_string(),
                "BPM" => {
                    tracker.bpm = value
                        .parse()
                        .map_err(|_| malformed(line_no, format!("invalid BPM '{}'", value)))?
                }
                "TPB" => {
                    tracker.ticks_per_beat = value.parse().map_err(|_| {
                        malformed(line_no, format!("invalid ticks per beat '{}'", value))
                    })?
                }
                "SPEED" => {
                    tracker.ticks_per_row = value
                        .parse()
                        .map_err(|_| malformed(line_no, format!("invalid speed '{}'", value)))?
                }
                "SEQUENCE" => {
                    tracker.order = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| s.parse::<usize>())
                        .collect::<Result<_, _>>()
                        .map_err(|_| malformed(line_no, format!("invalid sequence '{}'", value)))?;
                }
                other => log::debug!("Ignoring tracker header '{}'", other),
            }
            continue;
        }

        if line.to_uppercase().starts_with("PATTERN") {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let index: usize = tokens
                .get(1)
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| malformed(line_no, "PATTERN needs an index"))?;
            let rows = match tokens.iter().position(|t| t.eq_ignore_ascii_case("ROWS")) {
                Some(pos) => tokens
                    .get(pos + 1)
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| malformed(line_no, "ROWS needs a count"))?,
                None => DEFAULT_ROWS,
            };
            if tracker.pattern(index).is_some() {
                return Err(malformed(line_no, format!("pattern {} defined twice", index)));
            }
            if rows > MAX_ROWS_PER_PATTERN {
                return Err(malformed(
                    line_no,
                    format!("pattern {} has {} rows, limit is {}", index, rows, MAX_ROWS_PER_PATTERN),
                ));
            }
            declared_rows += rows;
            if declared_rows > MAX_SONG_ROWS {
                return Err(malformed(
                    line_no,
                    format!("song exceeds {} rows", MAX_SONG_ROWS),
                ));
            }
            tracker.patterns.push(Pattern::new(index, rows));
            current = Some(tracker.patterns.len() - 1);
            next_row = 0;
            continue;
        }

        let Some((prefix, rest)) = line.split_once('|') else {
            return Err(malformed(line_no, format!("unrecognised line '{}'", line)));
        };
        let pattern = current
            .and_then(|p| tracker.patterns.get_mut(p))
            .ok_or_else(|| malformed(line_no, "row before any PATTERN"))?;

        let prefix = prefix.trim();
        let row_index = if prefix.is_empty() {
            next_row
        } else {
            prefix
                .parse::<usize>()
                .map_err(|_| malformed(line_no, format!("invalid row index '{}'", prefix)))?
        };
        if row_index >= pattern.rows.len() {
            return Err(malformed(
                line_no,
                format!(
                    "row {} out of range for pattern {} with {} rows",
                    row_index,
                    pattern.index,
                    pattern.rows.len()
                ),
            ));
        }

        let mut segments: Vec<&str> = rest.split('|').collect();
        if segments.len() > 1 && segments.last().map_or(false, |s| s.trim().is_empty()) {
            segments.pop();
        }

        let row = &mut pattern.rows[row_index];
        row.cells.clear();
        for segment in segments {
            row.cells
                .push(parse_cell(segment).map_err(|e| malformed(line_no, e))?);
        }
        while matches!(row.cells.last(), Some(None)) {
            row.cells.pop();
        }
        next_row = row_index + 1;
    }

    Ok(tracker)
}

fn render_cell(cell: Option<&Cell>) -> String {
    let Some(cell) = cell else {
        return "... .. ..".to_string();
    };

    let note = match cell.note {
        Some(NoteCommand::Play(n)) => note_name(n),
        Some(NoteCommand::Cut) => "===".to_string(),
        None => "...".to_string(),
    };
    let opt = |v: Option<u8>| v.map_or_else(|| "..".to_string(), |v| format!("{:02}", v));

    let mut out = format!("{} {} {}", note, opt(cell.instrument), opt(cell.velocity));
    if let Some(sustain) = cell.sustain {
        out.push_str(&format!(" S{}", sustain));
    }
    for c in &cell.controls {
        out.push_str(&format!(" C{}={}", c.controller, c.value));
    }
    out
}

/// Render a tracker in the text format. Empty rows are omitted.
pub fn render_tracker(tracker: &Tracker) -> String {
    let mut out = String::new();
    if !tracker.title.is_empty() {
        out.push_str(&format!("#TITLE: {}\n", tracker.title));
    }
    out.push_str(&format!("#BPM: {}\n", tracker.bpm));
    out.push_str(&format!("#TPB: {}\n", tracker.ticks_per_beat));
    out.push_str(&format!("#SPEED: {}\n", tracker.ticks_per_row));
    if !tracker.order.is_empty() {
        let order: Vec<String> = tracker.order.iter().map(|i| i.to_string()).collect();
        out.push_str(&format!("#SEQUENCE: {}\n", order.join(",")));
    }

    for pattern in &tracker.patterns {
        out.push_str(&format!("\nPATTERN {} ROWS {}\n", pattern.index, pattern.rows.len()));
        let width = pattern.rows.len().saturating_sub(1).to_string().len().max(2);
        let channels = pattern.channel_count();

        for (r, row) in pattern.rows.iter().enumerate() {
            if row.is_empty() {
                continue;
            }
            let cells: Vec<String> = (0..channels).map(|ch| render_cell(row.get(ch))).collect();
            out.push_str(&format!("{:0width$} | {} |\n", r, cells.join(" | "), width = width));
        }
    }
    out
}
