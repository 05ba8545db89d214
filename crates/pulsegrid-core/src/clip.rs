//! MIDI clip representation and the note container seam

use serde::{Deserialize, Serialize};

/// Beat positions closer than this are the same grid position
const BEAT_EPSILON: f64 = 1e-6;

/// Unique identifier for clips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClipId(pub u64);

/// A single MIDI note event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MidiNote {
    /// MIDI note number (0-127, 60 = middle C)
    pub pitch: u8,
    /// Velocity (0-127)
    pub velocity: u8,
    /// Start position in beats, relative to the clip start
    pub start_beat: f64,
    /// Duration in beats
    pub duration_beats: f64,
}

impl MidiNote {
    pub fn new(pitch: u8, velocity: u8, start_beat: f64, duration_beats: f64) -> Self {
        Self {
            pitch,
            velocity,
            start_beat,
            duration_beats,
        }
    }

    /// End beat (start + duration)
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }

    /// Same pitch at the same start position
    pub fn occupies_same_slot(&self, other: &MidiNote) -> bool {
        self.pitch == other.pitch && (self.start_beat - other.start_beat).abs() < BEAT_EPSILON
    }
}

/// A time-ranged note container owned by the host engine.
///
/// Times are in seconds on the host timeline; note positions are in beats
/// relative to [NoteContainer::start].
pub trait NoteContainer {
    fn notes(&self) -> Vec<MidiNote>;
    fn add_note(&mut self, note: MidiNote);
    /// Remove the first note in the same slot (pitch and start beat). Returns true if one was removed.
    fn remove_note(&mut self, note: &MidiNote) -> bool;
    fn clear(&mut self);
    fn start(&self) -> f64;
    fn end(&self) -> f64;
    fn set_end(&mut self, end: f64);

    fn is_empty(&self) -> bool {
        self.notes().is_empty()
    }
}

/// MIDI clip containing note events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiClip {
    pub id: ClipId,
    /// Clip name/label
    pub name: String,
    /// Start position on the timeline in seconds
    pub start_secs: f64,
    /// End position on the timeline in seconds
    pub end_secs: f64,
    /// Notes sorted by start_beat
    pub notes: Vec<MidiNote>,
}

impl MidiClip {
    pub fn new(id: ClipId, start_secs: f64, end_secs: f64) -> Self {
        Self {
            id,
            name: String::new(),
            start_secs,
            end_secs: end_secs.max(start_secs),
            notes: Vec::new(),
        }
    }

    pub fn with_notes(mut self, notes: impl IntoIterator<Item = MidiNote>) -> Self {
        for note in notes {
            self.insert_sorted(note);
        }
        self
    }

    /// Length in seconds
    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }

    fn insert_sorted(&mut self, note: MidiNote) {
        let idx = self
            .notes
            .iter()
            .position(|n| n.start_beat > note.start_beat)
            .unwrap_or(self.notes.len());
        self.notes.insert(idx, note);
    }
}

impl NoteContainer for MidiClip {
    fn notes(&self) -> Vec<MidiNote> {
        self.notes.clone()
    }

    /// Add a note, keeping notes sorted by start_beat
    fn add_note(&mut self, note: MidiNote) {
        self.insert_sorted(note);
    }

    fn remove_note(&mut self, note: &MidiNote) -> bool {
        let Some(idx) = self.notes.iter().position(|n| n.occupies_same_slot(note)) else {
            return false;
        };
        self.notes.remove(idx);
        true
    }

    fn clear(&mut self) {
        self.notes.clear();
    }

    fn start(&self) -> f64 {
        self.start_secs
    }

    fn end(&self) -> f64 {
        self.end_secs
    }

    fn set_end(&mut self, end: f64) {
        self.end_secs = end.max(self.start_secs);
    }

    fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}
