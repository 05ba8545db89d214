//! Step sequencer: a quantized step grid kept in sync with a MIDI clip
//!
//! The grid covers 24 channels (two octaves) by up to four measures. The
//! sequencer imports a clip's notes into the grid, writes the grid back to the
//! clip, and exposes a cursor, a range selection and a clipboard for
//! controller-driven editing.

use std::fmt;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clip::{MidiNote, NoteContainer};
use crate::error::{PulseGridError, Result};
use crate::notify::Notifier;
use crate::step_channel::{StepChannel, MAX_CHANNELS, MAX_INTENSITY, MAX_NOTES_PER_MEASURE};
use crate::step_sequence::StepSequence;
use crate::transport::{TempoSource, TransportControl};

/// Lowest pitch the grid can show; channel 0 of octave -4
pub const MIN_NOTE_NUMBER: i32 = 5;
pub const MIN_OCTAVE: i32 = -4;
pub const MAX_OCTAVE: i32 = 4;
pub const NOTES_PER_OCTAVE: i32 = 12;
pub const BEATS_PER_MEASURE: f64 = 4.0;
/// Grid resolutions, coarsest first
pub const NOTES_PER_MEASURE_OPTIONS: [usize; 3] = [4, 8, 16];

const VELOCITY_PER_INTENSITY: u8 = 18;
const DEFAULT_SECONDS_PER_BEAT: f64 = 0.5;

/// Bucket a MIDI velocity into the grid's intensity tiers (0, 3, 5 or 7)
pub fn velocity_to_intensity(velocity: u8) -> u8 {
    let raw = (f64::from(velocity) * f64::from(MAX_INTENSITY) / 127.0).round() as u8;
    match raw {
        2..=3 => 3,
        4..=5 => 5,
        6.. => 7,
        _ => 0,
    }
}

/// Velocity written for an intensity (0-7 maps to 0-126)
pub fn intensity_to_velocity(intensity: u8) -> u8 {
    intensity.min(MAX_INTENSITY) * VELOCITY_PER_INTENSITY
}

/// Intensity after a toggle.
///
/// Stopped: 0 -> 3 -> 5 -> 7 -> 0. Playing: on/off only, on at full intensity.
pub fn next_intensity(current: u8, is_playing: bool) -> u8 {
    match (is_playing, current) {
        (true, 0) => MAX_INTENSITY,
        (true, _) => 0,
        (false, 0..=2) => 3,
        (false, 3..=4) => 5,
        (false, 5..=6) => 7,
        (false, _) => 0,
    }
}

/// Change notifications published by [StepSequencer]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSequencerEvent {
    PatternChanged,
    SelectedNoteIndexChanged(usize),
    NumberOfNotesChanged(usize),
    NotesPerMeasureChanged(usize),
    RangeSelectionEnabledChanged(bool),
}

/// A clipboard cell, positioned relative to the start of the copied range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopiedNote {
    pub index: usize,
    pub channel: usize,
    pub intensity: u8,
}

/// Why a clip can't be shown on the step grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotEditableReason {
    /// The notes need more than the 24 channels of the grid
    OctaveSpanTooWide { lowest_pitch: u8, highest_pitch: u8 },
    /// The lowest note sits outside the selectable octaves
    OctaveOutOfRange(i32),
}

impl fmt::Display for NotEditableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OctaveSpanTooWide { lowest_pitch, highest_pitch } => write!(
                f,
                "notes {lowest_pitch}..={highest_pitch} span more than {MAX_CHANNELS} channels"
            ),
            Self::OctaveOutOfRange(octave) => {
                write!(f, "octave {octave} is outside {MIN_OCTAVE}..={MAX_OCTAVE}")
            }
        }
    }
}

/// A rejected clip, handed back to the caller untouched
#[derive(Debug)]
pub struct NotEditable<C> {
    pub clip: C,
    pub reason: NotEditableReason,
}

/// Persisted sequencer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSequencerState {
    pub selected_note_index: usize,
    pub number_of_notes: usize,
    pub notes_per_measure: usize,
    pub range_anchor_index: usize,
    pub range_selection_enabled: bool,
    pub octave: i32,
    pub sequence: StepSequence,
}

impl Default for StepSequencerState {
    fn default() -> Self {
        Self {
            selected_note_index: 0,
            number_of_notes: StepChannel::max_number_of_notes(MAX_NOTES_PER_MEASURE),
            notes_per_measure: MAX_NOTES_PER_MEASURE,
            range_anchor_index: 0,
            range_selection_enabled: false,
            octave: 0,
            sequence: StepSequence::default(),
        }
    }
}

/// Lowest octave holding every note, or the reason the notes don't fit the grid
fn clip_octave(notes: &[MidiNote]) -> std::result::Result<Option<i32>, NotEditableReason> {
    let Some(lowest) = notes.iter().map(|n| n.pitch).min() else {
        return Ok(None);
    };
    let highest = notes.iter().map(|n| n.pitch).max().unwrap_or(lowest);

    let zero_based = (i32::from(lowest) - MIN_NOTE_NUMBER).div_euclid(NOTES_PER_OCTAVE);
    let octave = zero_based + MIN_OCTAVE;
    if !(MIN_OCTAVE..=MAX_OCTAVE).contains(&octave) {
        return Err(NotEditableReason::OctaveOutOfRange(octave));
    }

    let window_start = MIN_NOTE_NUMBER + NOTES_PER_OCTAVE * zero_based;
    if i32::from(highest) - window_start >= MAX_CHANNELS as i32 {
        return Err(NotEditableReason::OctaveSpanTooWide {
            lowest_pitch: lowest,
            highest_pitch: highest,
        });
    }
    Ok(Some(octave))
}

fn seconds_per_beat(tempo: &dyn TempoSource, at_secs: f64) -> f64 {
    let beats_per_second = tempo.beats_per_second_at(at_secs);
    if beats_per_second > 0.0 {
        1.0 / beats_per_second
    } else {
        DEFAULT_SECONDS_PER_BEAT
    }
}

/// Step grid editor bound to a note container.
///
/// Idle until [StepSequencer::bind] succeeds. Grid edits made while stopped
/// stay in the grid until the next export (on play, unbind, or a resolution
/// change); edits made while playing are also written to the clip at once so
/// they are heard on the next loop.
#[derive(Debug)]
pub struct StepSequencer<C> {
    sequence: StepSequence,
    clip: Option<C>,
    notes_per_measure: usize,
    number_of_notes: usize,
    selected_note_index: usize,
    range_anchor_index: usize,
    range_selection_enabled: bool,
    copied_notes: Vec<CopiedNote>,
    octave: i32,
    is_playing: bool,
    seconds_per_beat: f64,
    /// Grid holds edits the clip hasn't seen yet
    dirty: bool,
    notifier: Notifier<StepSequencerEvent>,
}

impl<C: NoteContainer> Default for StepSequencer<C> {
    fn default() -> Self {
        Self::from_state(StepSequencerState::default())
    }
}

impl<C: NoteContainer> StepSequencer<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: StepSequencerState) -> Self {
        let mut sequencer = Self {
            sequence: StepSequence::default(),
            clip: None,
            notes_per_measure: MAX_NOTES_PER_MEASURE,
            number_of_notes: StepChannel::max_number_of_notes(MAX_NOTES_PER_MEASURE),
            selected_note_index: 0,
            range_anchor_index: 0,
            range_selection_enabled: false,
            copied_notes: Vec::new(),
            octave: 0,
            is_playing: false,
            seconds_per_beat: DEFAULT_SECONDS_PER_BEAT,
            dirty: false,
            notifier: Notifier::new(),
        };
        sequencer.restore_state(state);
        sequencer
    }

    pub fn state(&self) -> StepSequencerState {
        StepSequencerState {
            selected_note_index: self.selected_note_index,
            number_of_notes: self.number_of_notes,
            notes_per_measure: self.notes_per_measure,
            range_anchor_index: self.range_anchor_index,
            range_selection_enabled: self.range_selection_enabled,
            octave: self.octave,
            sequence: self.sequence.clone(),
        }
    }

    /// Replace the grid and view state; out-of-range values are clamped
    pub fn restore_state(&mut self, state: StepSequencerState) {
        self.notes_per_measure = if NOTES_PER_MEASURE_OPTIONS.contains(&state.notes_per_measure) {
            state.notes_per_measure
        } else {
            warn!(
                notes_per_measure = state.notes_per_measure,
                "unsupported resolution in saved state, using default"
            );
            MAX_NOTES_PER_MEASURE
        };
        self.number_of_notes = state.number_of_notes.clamp(1, self.max_number_of_notes());
        self.selected_note_index = state.selected_note_index % self.number_of_notes;
        self.range_anchor_index = state.range_anchor_index.min(self.max_number_of_notes());
        self.range_selection_enabled = state.range_selection_enabled;
        self.octave = state.octave.clamp(MIN_OCTAVE, MAX_OCTAVE);
        self.sequence = state.sequence;
        self.dirty = self.clip.is_some();
        self.update_clip_end();

        for event in self.snapshot_events() {
            self.notifier.notify(event);
        }
    }

    /// Subscribe to change notifications. The current value of every
    /// notification is queued first.
    pub fn subscribe(&mut self) -> Receiver<StepSequencerEvent> {
        let initial = self.snapshot_events();
        self.notifier.subscribe_with(initial)
    }

    fn snapshot_events(&self) -> [StepSequencerEvent; 5] {
        [
            StepSequencerEvent::PatternChanged,
            StepSequencerEvent::SelectedNoteIndexChanged(self.selected_note_index),
            StepSequencerEvent::NumberOfNotesChanged(self.number_of_notes),
            StepSequencerEvent::NotesPerMeasureChanged(self.notes_per_measure),
            StepSequencerEvent::RangeSelectionEnabledChanged(self.range_selection_enabled),
        ]
    }

    // ============================================================================
    // Binding
    // ============================================================================

    /// Bind to a clip and import its notes.
    ///
    /// The octave moves to the lowest octave used by the clip. A clip whose
    /// notes don't fit the grid is handed back without touching any state.
    /// A clip that was already bound is unbound first and returned with the
    /// grid written to it.
    pub fn bind(
        &mut self,
        clip: C,
        tempo: &dyn TempoSource,
    ) -> std::result::Result<Option<C>, NotEditable<C>> {
        let notes = clip.notes();
        let octave = match clip_octave(&notes) {
            Ok(Some(octave)) => octave,
            Ok(None) => self.octave,
            Err(reason) => {
                debug!(%reason, "clip can't be shown on the step grid");
                return Err(NotEditable { clip, reason });
            }
        };
        let previous = self.unbind();
        if octave != self.octave {
            debug!(octave, "moving to the clip's octave");
            self.octave = octave;
        }

        self.seconds_per_beat = seconds_per_beat(tempo, clip.start());
        let duration_beats = ((clip.end() - clip.start()) / self.seconds_per_beat).round();
        let default_number_of_notes =
            (duration_beats * self.notes_per_measure as f64 / BEATS_PER_MEASURE).round() as usize;

        self.clip = Some(clip);
        self.import_from_clip();
        self.apply_number_of_notes(default_number_of_notes);
        self.export_to_clip();
        debug!(
            number_of_notes = self.number_of_notes,
            notes = notes.len(),
            "bound clip to step grid"
        );
        Ok(previous)
    }

    /// Write the grid back to the clip, clear the grid and hand the clip back
    pub fn unbind(&mut self) -> Option<C> {
        self.export_to_clip();
        let clip = self.clip.take()?;
        self.sequence.clear();
        self.dirty = false;
        self.is_playing = false;
        self.notifier.notify(StepSequencerEvent::PatternChanged);
        if clip.is_empty() {
            debug!("unbound clip holds no notes");
        }
        Some(clip)
    }

    pub fn is_bound(&self) -> bool {
        self.clip.is_some()
    }

    pub fn clip(&self) -> Option<&C> {
        self.clip.as_ref()
    }

    /// Clip span in seconds, used as the playback loop
    pub fn loop_range(&self) -> Option<(f64, f64)> {
        self.clip.as_ref().map(|clip| (clip.start(), clip.end()))
    }

    // ============================================================================
    // Clip <-> grid
    // ============================================================================

    /// Replace the grid with the clip's notes, quantized to the current resolution
    pub fn import_from_clip(&mut self) {
        let Some(clip) = &self.clip else { return };
        let notes = clip.notes();
        self.fill_from_notes(&notes);
        self.dirty = false;
        debug!(notes = notes.len(), "imported clip into step grid");
    }

    /// Replace the clip's notes with one note per active grid cell
    pub fn export_to_clip(&mut self) {
        let notes = self.grid_notes();
        let Some(clip) = self.clip.as_mut() else { return };
        clip.clear();
        for note in &notes {
            clip.add_note(*note);
        }
        self.dirty = false;
        debug!(notes = notes.len(), "exported step grid to clip");
    }

    fn fill_from_notes(&mut self, notes: &[MidiNote]) {
        self.sequence.clear();
        for note in notes {
            let step = (note.start_beat * self.notes_per_measure as f64 / BEATS_PER_MEASURE).round();
            if step < 0.0 {
                continue;
            }
            let Some(channel) = self.pitch_to_channel(note.pitch) else {
                warn!(pitch = note.pitch, octave = self.octave, "note outside the grid window, skipped");
                continue;
            };
            let intensity = velocity_to_intensity(note.velocity);
            if intensity == 0 {
                continue;
            }
            if let Some(slot) = self.sequence.channel_mut(channel) {
                slot.set_note(step as usize, intensity);
            }
        }
        self.notifier.notify(StepSequencerEvent::PatternChanged);
    }

    fn grid_notes(&self) -> Vec<MidiNote> {
        let max = self.max_number_of_notes();
        self.sequence
            .active_cells()
            .filter(|(_, step, _)| *step < max)
            .map(|(channel, step, intensity)| self.note_for_cell(channel, step, intensity))
            .collect()
    }

    fn note_for_cell(&self, channel: usize, note_index: usize, intensity: u8) -> MidiNote {
        let step_beats = self.step_duration_beats();
        MidiNote::new(
            self.channel_to_pitch(channel),
            intensity_to_velocity(intensity),
            note_index as f64 * step_beats,
            step_beats,
        )
    }

    fn write_cell_to_clip(&mut self, channel: usize, note_index: usize, intensity: u8) {
        let note = self.note_for_cell(channel, note_index, intensity);
        let Some(clip) = self.clip.as_mut() else { return };
        clip.remove_note(&note);
        if intensity > 0 {
            clip.add_note(note);
        }
    }

    /// Store a cell, then either write it through (playing) or leave it for the next export
    fn commit_cell(&mut self, channel: usize, note_index: usize, intensity: u8) {
        let Some(slot) = self.sequence.channel_mut(channel) else {
            warn!(channel, "channel out of range, edit ignored");
            return;
        };
        slot.set_note(note_index, intensity);
        let stored = slot.note(note_index);

        if self.is_playing {
            self.write_cell_to_clip(channel, note_index, stored);
        } else {
            self.dirty = true;
        }
    }

    fn update_clip_end(&mut self) {
        let length_secs =
            self.number_of_notes as f64 * self.step_duration_beats() * self.seconds_per_beat;
        if let Some(clip) = self.clip.as_mut() {
            let end = clip.start() + length_secs;
            clip.set_end(end);
        }
    }

    // ============================================================================
    // Grid queries and edits
    // ============================================================================

    pub fn sequence(&self) -> &StepSequence {
        &self.sequence
    }

    pub fn num_channels(&self) -> usize {
        MAX_CHANNELS
    }

    /// Steps per channel at the current resolution
    pub fn max_number_of_notes(&self) -> usize {
        StepChannel::max_number_of_notes(self.notes_per_measure)
    }

    pub fn note_intensity_at(&self, channel: usize, note_index: usize) -> u8 {
        self.sequence.note(channel, note_index)
    }

    pub fn has_note_at(&self, channel: usize, note_index: usize) -> bool {
        self.note_intensity_at(channel, note_index) > 0
    }

    pub fn step_duration_beats(&self) -> f64 {
        BEATS_PER_MEASURE / self.notes_per_measure as f64
    }

    pub fn octave(&self) -> i32 {
        self.octave
    }

    /// Move the grid window; the pattern keeps its channels
    pub fn set_octave(&mut self, octave: i32) {
        let octave = octave.clamp(MIN_OCTAVE, MAX_OCTAVE);
        if octave != self.octave {
            self.octave = octave;
            self.dirty = self.clip.is_some();
        }
    }

    fn zero_based_octave(&self) -> i32 {
        self.octave - MIN_OCTAVE
    }

    pub fn channel_to_pitch(&self, channel: usize) -> u8 {
        let pitch = channel as i32 + NOTES_PER_OCTAVE * self.zero_based_octave() + MIN_NOTE_NUMBER;
        pitch.clamp(0, 127) as u8
    }

    /// Channel for a pitch, or None when the pitch is outside the grid window
    pub fn pitch_to_channel(&self, pitch: u8) -> Option<usize> {
        let channel = i32::from(pitch) - MIN_NOTE_NUMBER - NOTES_PER_OCTAVE * self.zero_based_octave();
        (0..MAX_CHANNELS as i32)
            .contains(&channel)
            .then_some(channel as usize)
    }

    /// Set one cell directly
    pub fn set_note_intensity(&mut self, channel: usize, note_index: usize, intensity: u8) {
        self.commit_cell(channel, note_index, intensity);
        self.notifier.notify(StepSequencerEvent::PatternChanged);
    }

    /// Cycle the intensity of `channel` at the cursor. Returns the new intensity.
    pub fn toggle_at_cursor(&mut self, channel: usize) -> Option<u8> {
        let current = self.sequence.channel(channel)?.note(self.selected_note_index);
        let next = next_intensity(current, self.is_playing);
        self.commit_cell(channel, self.selected_note_index, next);
        self.notifier.notify(StepSequencerEvent::PatternChanged);
        Some(next)
    }

    /// [StepSequencer::toggle_at_cursor] addressed by pitch
    pub fn toggle_note_number_at_cursor(&mut self, pitch: u8) -> Option<u8> {
        let channel = self.pitch_to_channel(pitch)?;
        self.toggle_at_cursor(channel)
    }

    pub fn clear_notes_at_selected_index(&mut self) {
        let index = self.selected_note_index;
        for channel in 0..MAX_CHANNELS {
            self.commit_cell(channel, index, 0);
        }
        self.notifier.notify(StepSequencerEvent::PatternChanged);
    }

    // ============================================================================
    // Cursor and length
    // ============================================================================

    pub fn selected_note_index(&self) -> usize {
        self.selected_note_index
    }

    fn select(&mut self, index: usize) {
        if index != self.selected_note_index {
            self.selected_note_index = index;
            self.notifier
                .notify(StepSequencerEvent::SelectedNoteIndexChanged(index));
        }
    }

    /// Move the cursor; wraps modulo the number of notes
    pub fn set_selected_note_index(&mut self, index: usize) {
        self.select(index % self.number_of_notes);
    }

    pub fn increment_selected_note_index(&mut self) {
        if self.is_playing {
            return;
        }
        self.select((self.selected_note_index + 1) % self.number_of_notes);
    }

    pub fn decrement_selected_note_index(&mut self) {
        if self.is_playing {
            return;
        }
        let n = self.number_of_notes;
        self.select((self.selected_note_index + n - 1) % n);
    }

    pub fn number_of_notes(&self) -> usize {
        self.number_of_notes
    }

    /// Clamped into `1..=max_number_of_notes()`; the clip end follows
    pub fn set_number_of_notes(&mut self, number_of_notes: usize) {
        self.apply_number_of_notes(number_of_notes);
    }

    pub fn increment_number_of_notes(&mut self) {
        if self.is_playing {
            return;
        }
        self.apply_number_of_notes(self.number_of_notes + 1);
    }

    pub fn decrement_number_of_notes(&mut self) {
        if self.is_playing {
            return;
        }
        self.apply_number_of_notes(self.number_of_notes.saturating_sub(1));
    }

    fn apply_number_of_notes(&mut self, requested: usize) {
        let clamped = requested.clamp(1, self.max_number_of_notes());
        let changed = clamped != self.number_of_notes;
        self.number_of_notes = clamped;
        self.update_clip_end();
        if changed {
            self.notifier
                .notify(StepSequencerEvent::NumberOfNotesChanged(clamped));
        }
        if self.selected_note_index >= clamped {
            self.select(clamped - 1);
        }
    }

    // ============================================================================
    // Grid resolution
    // ============================================================================

    pub fn notes_per_measure(&self) -> usize {
        self.notes_per_measure
    }

    /// Next finer resolution; stays at 16
    pub fn increment_notes_per_measure(&mut self) {
        if self.is_playing {
            return;
        }
        let Some(pos) = NOTES_PER_MEASURE_OPTIONS
            .iter()
            .position(|&n| n == self.notes_per_measure)
        else {
            return;
        };
        if let Some(&next) = NOTES_PER_MEASURE_OPTIONS.get(pos + 1) {
            self.change_notes_per_measure(next);
        }
    }

    /// Next coarser resolution; stays at 4. Notes off the coarser grid are approximated.
    pub fn decrement_notes_per_measure(&mut self) {
        if self.is_playing {
            return;
        }
        let Some(pos) = NOTES_PER_MEASURE_OPTIONS
            .iter()
            .position(|&n| n == self.notes_per_measure)
        else {
            return;
        };
        if pos > 0 {
            self.change_notes_per_measure(NOTES_PER_MEASURE_OPTIONS[pos - 1]);
        }
    }

    pub fn set_notes_per_measure(&mut self, notes_per_measure: usize) -> Result<()> {
        if !NOTES_PER_MEASURE_OPTIONS.contains(&notes_per_measure) {
            return Err(PulseGridError::UnsupportedNotesPerMeasure(notes_per_measure));
        }
        if notes_per_measure != self.notes_per_measure {
            self.change_notes_per_measure(notes_per_measure);
        }
        Ok(())
    }

    fn change_notes_per_measure(&mut self, new: usize) {
        let old = self.notes_per_measure;

        // The clip is resampled rather than the grid so a round trip through a
        // coarse resolution keeps the fine notes, unless the grid holds edits
        // the clip hasn't seen.
        let unbound_notes = if self.clip.is_some() {
            if self.dirty {
                self.export_to_clip();
            }
            None
        } else {
            Some(self.grid_notes())
        };

        let scaled = (new as f64 * self.number_of_notes as f64 / old as f64).round() as usize;
        self.notes_per_measure = new;
        self.range_anchor_index = self.range_anchor_index.min(self.max_number_of_notes());
        self.notifier
            .notify(StepSequencerEvent::NotesPerMeasureChanged(new));
        self.apply_number_of_notes(scaled);

        match unbound_notes {
            Some(notes) => self.fill_from_notes(&notes),
            None => self.import_from_clip(),
        }
        debug!(old, new, number_of_notes = self.number_of_notes, "changed grid resolution");
    }

    // ============================================================================
    // Selection and clipboard
    // ============================================================================

    pub fn is_range_selection_enabled(&self) -> bool {
        self.range_selection_enabled
    }

    /// Enabling anchors the range at the cursor; disabling resets the anchor
    pub fn toggle_range_selection(&mut self) {
        self.range_selection_enabled = !self.range_selection_enabled;
        self.range_anchor_index = if self.range_selection_enabled {
            self.selected_note_index
        } else {
            0
        };
        self.notifier.notify(StepSequencerEvent::RangeSelectionEnabledChanged(
            self.range_selection_enabled,
        ));
    }

    pub fn range_anchor_index(&self) -> usize {
        self.range_anchor_index
    }

    pub fn range_start(&self) -> usize {
        self.range_anchor_index.min(self.selected_note_index)
    }

    pub fn range_end(&self) -> usize {
        self.range_anchor_index.max(self.selected_note_index)
    }

    pub fn copied_notes(&self) -> &[CopiedNote] {
        &self.copied_notes
    }

    /// Copy every active cell of the selected range, across all channels.
    /// Returns the number of cells copied; needs an active range.
    pub fn copy_selection(&mut self) -> usize {
        if !self.range_selection_enabled {
            return 0;
        }
        let (from, to) = (self.range_start(), self.range_end());
        self.copied_notes = self
            .sequence
            .active_cells()
            .filter(|(_, step, _)| (from..=to).contains(step))
            .map(|(channel, step, intensity)| CopiedNote {
                index: step - from,
                channel,
                intensity,
            })
            .collect();
        debug!(from, to, count = self.copied_notes.len(), "copied selection");
        self.copied_notes.len()
    }

    /// Paste the clipboard at the cursor. Cells past the last note are dropped.
    /// No-op while a range is selected or the clipboard is empty.
    pub fn paste_selection(&mut self) -> usize {
        if self.range_selection_enabled || self.copied_notes.is_empty() {
            return 0;
        }
        let from = self.selected_note_index;
        let mut pasted = 0;
        for note in self.copied_notes.clone() {
            let target = from + note.index;
            if target >= self.number_of_notes {
                continue;
            }
            self.commit_cell(note.channel, target, note.intensity);
            pasted += 1;
        }
        if pasted > 0 {
            self.notifier.notify(StepSequencerEvent::PatternChanged);
        }
        debug!(at = from, pasted, "pasted selection");
        pasted
    }

    // ============================================================================
    // Transport
    // ============================================================================

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    /// Write the grid to the clip and loop playback over it. No-op when already playing.
    pub fn play(&mut self, transport: &mut dyn TransportControl) {
        if transport.is_playing() {
            self.is_playing = true;
            return;
        }
        let Some((start, end)) = self.loop_range() else {
            warn!("play requested without a bound clip");
            return;
        };
        self.export_to_clip();
        transport.set_loop_range(start, end);
        transport.play();
        self.is_playing = true;
    }

    /// Halt playback, or when already stopped rewind to the clip start
    pub fn stop(&mut self, transport: &mut dyn TransportControl) {
        self.is_playing = false;
        if transport.is_playing() {
            transport.stop();
        } else if let Some(clip) = &self.clip {
            transport.set_position(clip.start());
        }
    }

    /// Transport started or stopped outside the sequencer
    pub fn transport_state_changed(&mut self, is_playing: bool) {
        self.is_playing = is_playing;
    }

    /// Tempo changed: the clip keeps its length in beats
    pub fn tempo_changed(&mut self, tempo: &dyn TempoSource) {
        let Some(clip) = &self.clip else { return };
        self.seconds_per_beat = seconds_per_beat(tempo, clip.start());
        self.update_clip_end();
    }

    /// Follow the playhead with the cursor
    pub fn playback_position_changed(&mut self, secs: f64, tempo: &dyn TempoSource) {
        let Some(clip) = &self.clip else { return };
        let beats = tempo.to_beats(secs) - tempo.to_beats(clip.start());
        if beats < 0.0 {
            return;
        }
        let step = (beats * self.notes_per_measure as f64 / BEATS_PER_MEASURE).floor() as usize;
        self.select(step % self.number_of_notes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{ClipId, MidiClip};
    use crate::transport::Transport;

    fn tempo() -> Transport {
        Transport::new(44100).with_bpm(120.0)
    }

    /// Four measures at 120 BPM
    fn empty_clip() -> MidiClip {
        MidiClip::new(ClipId(1), 0.0, 8.0)
    }

    fn bound(clip: MidiClip) -> StepSequencer<MidiClip> {
        let mut sequencer = StepSequencer::new();
        sequencer.bind(clip, &tempo()).unwrap();
        sequencer
    }

    #[test]
    fn test_velocity_buckets() {
        assert_eq!(velocity_to_intensity(0), 0);
        assert_eq!(velocity_to_intensity(27), 0); // raw 1
        assert_eq!(velocity_to_intensity(28), 3); // raw 2
        assert_eq!(velocity_to_intensity(60), 3); // raw 3
        assert_eq!(velocity_to_intensity(64), 5); // raw 4
        assert_eq!(velocity_to_intensity(90), 5); // raw 5
        assert_eq!(velocity_to_intensity(100), 7); // raw 6
        assert_eq!(velocity_to_intensity(127), 7);
        assert_eq!(intensity_to_velocity(7), 126);
        assert_eq!(intensity_to_velocity(3), 54);
    }

    #[test]
    fn test_next_intensity() {
        assert_eq!(next_intensity(0, false), 3);
        assert_eq!(next_intensity(3, false), 5);
        assert_eq!(next_intensity(5, false), 7);
        assert_eq!(next_intensity(7, false), 0);
        assert_eq!(next_intensity(0, true), 7);
        assert_eq!(next_intensity(3, true), 0);
    }

    #[test]
    fn test_bind_empty_clip_covers_four_measures() {
        let sequencer = bound(empty_clip());
        assert_eq!(sequencer.notes_per_measure(), 16);
        assert_eq!(sequencer.number_of_notes(), 64);
        assert_eq!(sequencer.loop_range(), Some((0.0, 8.0)));
    }

    #[test]
    fn test_toggle_to_full_then_export() {
        let mut sequencer = bound(empty_clip());
        assert_eq!(sequencer.toggle_at_cursor(0), Some(3));
        assert_eq!(sequencer.toggle_at_cursor(0), Some(5));
        assert_eq!(sequencer.toggle_at_cursor(0), Some(7));

        sequencer.export_to_clip();
        let notes = sequencer.clip().unwrap().notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].pitch, 53); // 5 + 12 * (0 - -4)
        assert_eq!(notes[0].start_beat, 0.0);
        assert_eq!(notes[0].duration_beats, 0.25);
        assert_eq!(notes[0].velocity, 126);
    }

    #[test]
    fn test_import_moves_to_clip_octave() {
        let clip = empty_clip().with_notes([
            MidiNote::new(62, 100, 0.0, 0.25),
            MidiNote::new(74, 64, 1.0, 0.25),
        ]);
        let sequencer = bound(clip);

        // 62 is in zero-based octave 4 (57..=68), i.e. octave 0
        assert_eq!(sequencer.octave(), 0);
        assert_eq!(sequencer.note_intensity_at(9, 0), 7);
        assert_eq!(sequencer.note_intensity_at(21, 4), 5);
    }

    #[test]
    fn test_wide_clip_is_rejected_whole() {
        let clip = empty_clip().with_notes([
            MidiNote::new(40, 100, 0.0, 0.25),
            MidiNote::new(80, 100, 1.0, 0.25),
        ]);
        let mut sequencer: StepSequencer<MidiClip> = StepSequencer::new();
        let err = sequencer.bind(clip, &tempo()).unwrap_err();

        assert!(matches!(err.reason, NotEditableReason::OctaveSpanTooWide { .. }));
        assert_eq!(err.clip.notes().len(), 2);
        assert!(!sequencer.is_bound());
        assert!(sequencer.sequence().is_empty());
    }

    #[test]
    fn test_clip_beyond_top_octave_is_rejected() {
        let clip = empty_clip().with_notes([MidiNote::new(126, 100, 0.0, 0.25)]);
        let mut sequencer: StepSequencer<MidiClip> = StepSequencer::new();
        let err = sequencer.bind(clip, &tempo()).unwrap_err();
        assert_eq!(err.reason, NotEditableReason::OctaveOutOfRange(6));
    }

    #[test]
    fn test_import_quantizes_to_nearest_step() {
        let clip = empty_clip().with_notes([MidiNote::new(53, 127, 0.26, 0.25)]);
        let sequencer = bound(clip);
        assert_eq!(sequencer.note_intensity_at(0, 1), 7);
    }

    #[test]
    fn test_resolution_change_preserves_duration() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_number_of_notes(48);

        sequencer.decrement_notes_per_measure();
        assert_eq!(sequencer.notes_per_measure(), 8);
        assert_eq!(sequencer.number_of_notes(), 24);
        assert_eq!(sequencer.loop_range(), Some((0.0, 6.0)));

        sequencer.decrement_notes_per_measure();
        sequencer.decrement_notes_per_measure();
        assert_eq!(sequencer.notes_per_measure(), 4);
        assert_eq!(sequencer.number_of_notes(), 12);

        sequencer.increment_notes_per_measure();
        sequencer.increment_notes_per_measure();
        sequencer.increment_notes_per_measure();
        assert_eq!(sequencer.notes_per_measure(), 16);
        assert_eq!(sequencer.number_of_notes(), 48);
    }

    #[test]
    fn test_coarse_round_trip_keeps_clip_notes() {
        let clip = empty_clip().with_notes([
            MidiNote::new(53, 127, 0.0, 0.25),
            MidiNote::new(53, 127, 0.25, 0.25),
        ]);
        let mut sequencer = bound(clip);

        sequencer.decrement_notes_per_measure();
        sequencer.decrement_notes_per_measure();
        assert_eq!(sequencer.note_intensity_at(0, 0), 7);
        assert_eq!(sequencer.note_intensity_at(0, 1), 0);

        sequencer.increment_notes_per_measure();
        sequencer.increment_notes_per_measure();
        assert_eq!(sequencer.note_intensity_at(0, 0), 7);
        assert_eq!(sequencer.note_intensity_at(0, 1), 7);
    }

    #[test]
    fn test_resolution_change_keeps_unsaved_edits() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_selected_note_index(8);
        sequencer.toggle_at_cursor(2);

        sequencer.decrement_notes_per_measure();
        assert_eq!(sequencer.note_intensity_at(2, 4), 3);
    }

    #[test]
    fn test_resolution_stays_within_options() {
        let mut sequencer: StepSequencer<MidiClip> = StepSequencer::new();
        sequencer.increment_notes_per_measure();
        assert_eq!(sequencer.notes_per_measure(), 16);
        assert!(sequencer.set_notes_per_measure(12).is_err());
        sequencer.set_notes_per_measure(4).unwrap();
        sequencer.decrement_notes_per_measure();
        assert_eq!(sequencer.notes_per_measure(), 4);
    }

    #[test]
    fn test_cursor_wraps() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_number_of_notes(4);
        sequencer.decrement_selected_note_index();
        assert_eq!(sequencer.selected_note_index(), 3);
        sequencer.increment_selected_note_index();
        assert_eq!(sequencer.selected_note_index(), 0);
        sequencer.set_selected_note_index(9);
        assert_eq!(sequencer.selected_note_index(), 1);
    }

    #[test]
    fn test_number_of_notes_is_clamped() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_selected_note_index(63);
        sequencer.set_number_of_notes(0);
        assert_eq!(sequencer.number_of_notes(), 1);
        assert_eq!(sequencer.selected_note_index(), 0);
        sequencer.set_number_of_notes(500);
        assert_eq!(sequencer.number_of_notes(), 64);
    }

    #[test]
    fn test_range_is_normalized() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_selected_note_index(10);
        sequencer.toggle_range_selection();
        sequencer.set_selected_note_index(4);
        assert_eq!((sequencer.range_start(), sequencer.range_end()), (4, 10));
        sequencer.set_selected_note_index(12);
        assert_eq!((sequencer.range_start(), sequencer.range_end()), (10, 12));
    }

    #[test]
    fn test_copy_then_paste_reproduces_cells() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_note_intensity(0, 2, 3);
        sequencer.set_note_intensity(5, 3, 7);
        sequencer.set_note_intensity(9, 8, 5); // outside the range

        sequencer.set_selected_note_index(2);
        sequencer.toggle_range_selection();
        sequencer.set_selected_note_index(5);
        assert_eq!(sequencer.copy_selection(), 2);
        sequencer.toggle_range_selection();

        sequencer.set_selected_note_index(20);
        assert_eq!(sequencer.paste_selection(), 2);
        assert_eq!(sequencer.note_intensity_at(0, 20), 3);
        assert_eq!(sequencer.note_intensity_at(5, 21), 7);

        sequencer.set_selected_note_index(2);
        let before = sequencer.sequence().clone();
        sequencer.paste_selection();
        assert_eq!(sequencer.sequence(), &before);
    }

    #[test]
    fn test_paste_is_noop_with_range_or_empty_clipboard() {
        let mut sequencer = bound(empty_clip());
        assert_eq!(sequencer.paste_selection(), 0);

        sequencer.set_note_intensity(0, 0, 7);
        sequencer.toggle_range_selection();
        sequencer.copy_selection();
        assert_eq!(sequencer.paste_selection(), 0);
    }

    #[test]
    fn test_copy_needs_range() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_note_intensity(0, 0, 7);
        assert_eq!(sequencer.copy_selection(), 0);
        assert!(sequencer.copied_notes().is_empty());
    }

    #[test]
    fn test_toggle_while_playing_writes_through() {
        let mut sequencer = bound(empty_clip());
        let mut transport = tempo();
        sequencer.play(&mut transport);
        assert!(transport.is_playing());
        assert!(transport.loop_enabled);

        sequencer.set_selected_note_index(4);
        assert_eq!(sequencer.toggle_at_cursor(1), Some(7));
        let notes = sequencer.clip().unwrap().notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].start_beat, 1.0);

        assert_eq!(sequencer.toggle_at_cursor(1), Some(0));
        assert!(sequencer.clip().unwrap().notes().is_empty());
    }

    #[test]
    fn test_cursor_and_length_locked_while_playing() {
        let mut sequencer = bound(empty_clip());
        sequencer.transport_state_changed(true);
        sequencer.increment_selected_note_index();
        sequencer.decrement_number_of_notes();
        sequencer.decrement_notes_per_measure();
        assert_eq!(sequencer.selected_note_index(), 0);
        assert_eq!(sequencer.number_of_notes(), 64);
        assert_eq!(sequencer.notes_per_measure(), 16);
    }

    #[test]
    fn test_stop_twice_rewinds_to_clip_start() {
        let clip = MidiClip::new(ClipId(1), 2.0, 10.0);
        let mut sequencer = bound(clip);
        let mut transport = tempo();

        sequencer.play(&mut transport);
        sequencer.play(&mut transport);
        transport.set_position(5.0);

        sequencer.stop(&mut transport);
        assert!(!transport.is_playing());
        assert_eq!(transport.position(), 5.0);

        sequencer.stop(&mut transport);
        assert_eq!(transport.position(), 2.0);
    }

    #[test]
    fn test_cursor_follows_playhead() {
        let mut sequencer = bound(MidiClip::new(ClipId(1), 2.0, 10.0));
        // 1.5 s after the clip start = 3 beats = step 12 at 16 notes per measure
        sequencer.playback_position_changed(3.5, &tempo());
        assert_eq!(sequencer.selected_note_index(), 12);
    }

    #[test]
    fn test_tempo_change_keeps_length_in_beats() {
        let mut sequencer = bound(empty_clip());
        sequencer.tempo_changed(&Transport::new(44100).with_bpm(60.0));
        assert_eq!(sequencer.loop_range(), Some((0.0, 16.0)));
    }

    #[test]
    fn test_subscriber_gets_current_state_then_changes() {
        let mut sequencer = bound(empty_clip());
        let rx = sequencer.subscribe();
        let initial: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            initial,
            vec![
                StepSequencerEvent::PatternChanged,
                StepSequencerEvent::SelectedNoteIndexChanged(0),
                StepSequencerEvent::NumberOfNotesChanged(64),
                StepSequencerEvent::NotesPerMeasureChanged(16),
                StepSequencerEvent::RangeSelectionEnabledChanged(false),
            ]
        );

        sequencer.increment_selected_note_index();
        sequencer.toggle_range_selection();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                StepSequencerEvent::SelectedNoteIndexChanged(1),
                StepSequencerEvent::RangeSelectionEnabledChanged(true),
            ]
        );
    }

    #[test]
    fn test_unbind_returns_synced_clip() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_note_intensity(3, 7, 5);

        let clip = sequencer.unbind().unwrap();
        assert_eq!(clip.notes().len(), 1);
        assert_eq!(clip.notes()[0].pitch, 56);
        assert!(sequencer.sequence().is_empty());
        assert!(sequencer.unbind().is_none());
    }

    #[test]
    fn test_clear_at_cursor_leaves_other_steps() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_note_intensity(2, 9, 7);
        sequencer.set_note_intensity(5, 9, 3);
        sequencer.set_note_intensity(2, 10, 5);
        sequencer.set_selected_note_index(9);

        sequencer.clear_notes_at_selected_index();
        assert_eq!(sequencer.note_intensity_at(2, 9), 0);
        assert_eq!(sequencer.note_intensity_at(5, 9), 0);
        assert_eq!(sequencer.note_intensity_at(2, 10), 5);

        let clip = sequencer.unbind().unwrap();
        assert_eq!(clip.notes().len(), 1);
        assert_eq!(clip.notes()[0].start_beat, 2.5);
    }

    #[test]
    fn test_rebinding_returns_previous_clip_with_edits() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_note_intensity(0, 0, 7);

        let previous = sequencer
            .bind(MidiClip::new(ClipId(2), 0.0, 8.0), &tempo())
            .unwrap()
            .unwrap();
        assert_eq!(previous.id, ClipId(1));
        assert_eq!(previous.notes(), vec![MidiNote::new(53, 126, 0.0, 0.25)]);
        assert_eq!(sequencer.note_intensity_at(0, 0), 0);

        let current = sequencer.unbind().unwrap();
        assert_eq!(current.id, ClipId(2));
        assert!(current.notes().is_empty());
    }

    #[test]
    fn test_rejected_bind_keeps_current_clip() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_note_intensity(0, 0, 7);

        let wide = MidiClip::new(ClipId(2), 0.0, 8.0)
            .with_notes([MidiNote::new(40, 100, 0.0, 0.25), MidiNote::new(90, 100, 1.0, 0.25)]);
        assert!(sequencer.bind(wide, &tempo()).is_err());
        assert_eq!(sequencer.clip().map(|clip| clip.id), Some(ClipId(1)));
        assert_eq!(sequencer.note_intensity_at(0, 0), 7);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut sequencer = bound(empty_clip());
        sequencer.set_note_intensity(4, 9, 5);
        sequencer.set_selected_note_index(9);
        sequencer.decrement_notes_per_measure();

        let json = serde_json::to_string(&sequencer.state()).unwrap();
        let state: StepSequencerState = serde_json::from_str(&json).unwrap();
        let restored: StepSequencer<MidiClip> = StepSequencer::from_state(state);

        assert_eq!(restored.state(), sequencer.state());
        assert_eq!(restored.notes_per_measure(), 8);
    }
}
