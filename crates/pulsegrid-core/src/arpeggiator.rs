//! Arpeggiator: turns a set of held notes into a timed note sequence

use std::fmt;
use std::str::FromStr;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PulseGridError;
use crate::midi::MidiEvent;
use crate::notify::Notifier;

pub const MIN_RATE: f32 = 1.0;
pub const MAX_RATE: f32 = 16.0;
pub const RATE_STEP: f32 = 0.5;
pub const MIN_GATE: f32 = 0.05;
pub const MAX_GATE: f32 = 1.0;
pub const GATE_STEP: f32 = 0.05;
pub const MIN_OCTAVES: u8 = 1;
pub const MAX_OCTAVES: u8 = 4;
/// Most notes the held set tracks at once
pub const MAX_HELD_NOTES: usize = 128;

const DEFAULT_RATE: f32 = 4.0;
const DEFAULT_GATE: f32 = 0.5;
const DEFAULT_BPM: f64 = 120.0;
const NOTE_VELOCITY: u8 = 100;
const DEFAULT_SEED: u64 = 0x2545_f491_4f6c_dd1d;

/// Traversal order of the held notes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArpMode {
    Off,
    #[default]
    Up,
    Down,
    UpDown,
    Random,
}

impl ArpMode {
    pub const ALL: [ArpMode; 5] = [
        ArpMode::Off,
        ArpMode::Up,
        ArpMode::Down,
        ArpMode::UpDown,
        ArpMode::Random,
    ];

    pub fn index(self) -> u8 {
        match self {
            ArpMode::Off => 0,
            ArpMode::Up => 1,
            ArpMode::Down => 2,
            ArpMode::UpDown => 3,
            ArpMode::Random => 4,
        }
    }

    /// Out-of-range indices clamp to the last mode
    pub fn from_index(index: u8) -> Self {
        Self::ALL[usize::from(index).min(Self::ALL.len() - 1)]
    }

    pub fn name(self) -> &'static str {
        match self {
            ArpMode::Off => "Off",
            ArpMode::Up => "Up",
            ArpMode::Down => "Down",
            ArpMode::UpDown => "Up/Down",
            ArpMode::Random => "Random",
        }
    }

    /// Next mode in order; stays at Random
    pub fn next(self) -> Self {
        Self::from_index(self.index().saturating_add(1))
    }

    /// Previous mode in order; stays at Off
    pub fn previous(self) -> Self {
        Self::from_index(self.index().saturating_sub(1))
    }
}

impl fmt::Display for ArpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ArpMode {
    type Err = PulseGridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(ArpMode::Off),
            "up" => Ok(ArpMode::Up),
            "down" => Ok(ArpMode::Down),
            "updown" | "up-down" | "up/down" => Ok(ArpMode::UpDown),
            "random" => Ok(ArpMode::Random),
            _ => Err(PulseGridError::UnknownArpMode(s.to_string())),
        }
    }
}

/// Arpeggiator parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArpParams {
    pub enabled: bool,
    pub mode: ArpMode,
    /// Rate is steps per beat when true, steps per second otherwise
    pub tempo_sync: bool,
    pub rate: f32,
    /// Fraction of a step the note sounds for
    pub gate: f32,
    pub octaves: u8,
}

impl Default for ArpParams {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ArpMode::Up,
            tempo_sync: true,
            rate: DEFAULT_RATE,
            gate: DEFAULT_GATE,
            octaves: MIN_OCTAVES,
        }
    }
}

impl ArpParams {
    /// Copy with every value inside its domain
    pub fn clamped(self) -> Self {
        Self {
            rate: clamp_or(self.rate, MIN_RATE, MAX_RATE, DEFAULT_RATE),
            gate: clamp_or(self.gate, MIN_GATE, MAX_GATE, DEFAULT_GATE),
            octaves: self.octaves.clamp(MIN_OCTAVES, MAX_OCTAVES),
            ..self
        }
    }
}

fn clamp_or(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(min, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpeggiatorEvent {
    ParametersChanged,
    NotesChanged,
}

/// Note scheduler driven by a per-sample counter.
///
/// Held notes are kept sorted. Every step the sounding note is released and
/// the next note of the traversal starts; the note is also released once the
/// gate length has elapsed. At most one note sounds at a time.
#[derive(Debug)]
pub struct Arpeggiator {
    params: ArpParams,
    held_notes: Vec<u8>,
    cursor: usize,
    ascending: bool,
    active_note: Option<u8>,
    sample_counter: u32,
    /// Length of the current step, fixed when it starts
    step_samples: u32,
    /// Samples the current note sounds for, fixed when it starts
    note_samples: u32,
    /// Start a step on the next sample instead of waiting a full interval
    step_due: bool,
    rng_state: u64,
    notifier: Notifier<ArpeggiatorEvent>,
}

impl Default for Arpeggiator {
    fn default() -> Self {
        Self::new(ArpParams::default())
    }
}

impl Arpeggiator {
    pub fn new(params: ArpParams) -> Self {
        Self {
            params: params.clamped(),
            held_notes: Vec::new(),
            cursor: 0,
            ascending: true,
            active_note: None,
            sample_counter: 0,
            step_samples: 0,
            note_samples: 0,
            step_due: true,
            rng_state: DEFAULT_SEED,
            notifier: Notifier::new(),
        }
    }

    /// Seed for Random mode
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_state = seed;
        self
    }

    /// Subscribe to changes. The receiver starts with a `ParametersChanged`.
    pub fn subscribe(&mut self) -> Receiver<ArpeggiatorEvent> {
        self.notifier
            .subscribe_with([ArpeggiatorEvent::ParametersChanged])
    }

    // ============================================================================
    // Held notes
    // ============================================================================

    pub fn held_notes(&self) -> &[u8] {
        &self.held_notes
    }

    pub fn active_note(&self) -> Option<u8> {
        self.active_note
    }

    /// Add a held note and restart the traversal from its first note
    pub fn add_note(&mut self, pitch: u8) {
        let pitch = pitch.min(127);
        let Err(pos) = self.held_notes.binary_search(&pitch) else {
            return;
        };
        if self.held_notes.len() >= MAX_HELD_NOTES {
            warn!(pitch, "held note buffer full, note ignored");
            return;
        }
        if self.held_notes.is_empty() {
            self.step_due = true;
        }
        self.held_notes.insert(pos, pitch);
        self.reset_traversal();
        self.notifier.notify(ArpeggiatorEvent::NotesChanged);
    }

    /// Remove a held note. When the set empties, returns the note-off for the sounding note.
    pub fn remove_note(&mut self, pitch: u8) -> Option<MidiEvent> {
        let pos = self.held_notes.binary_search(&pitch).ok()?;
        self.held_notes.remove(pos);
        self.notifier.notify(ArpeggiatorEvent::NotesChanged);
        if self.held_notes.is_empty() {
            self.release(0)
        } else {
            None
        }
    }

    /// Release every held note, silencing the sounding note
    pub fn clear_notes(&mut self) -> Option<MidiEvent> {
        if self.held_notes.is_empty() {
            return self.release(0);
        }
        self.held_notes.clear();
        self.reset_traversal();
        self.notifier.notify(ArpeggiatorEvent::NotesChanged);
        self.release(0)
    }

    fn reset_traversal(&mut self) {
        self.cursor = 0;
        self.ascending = true;
    }

    /// Stop the sounding note and restart timing on the next step
    fn release(&mut self, sample_offset: u32) -> Option<MidiEvent> {
        self.sample_counter = 0;
        self.step_due = true;
        self.active_note
            .take()
            .map(|pitch| MidiEvent::note_off(pitch, sample_offset))
    }

    // ============================================================================
    // Traversal
    // ============================================================================

    /// Length of the held notes repeated across the octave span
    fn sequence_len(&self) -> usize {
        self.held_notes.len() * usize::from(self.params.octaves)
    }

    /// Pitch at `index` of the ascending held-notes-by-octave sequence, clamped to 127
    fn sequence_pitch(&self, index: usize) -> u8 {
        let held = self.held_notes.len();
        let note = self.held_notes[index % held];
        let octave = (index / held) as u16;
        (u16::from(note) + 12 * octave).min(127) as u8
    }

    fn next_random(&mut self, bound: usize) -> usize {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        ((self.rng_state >> 33) as usize) % bound.max(1)
    }

    /// Next note of the traversal, or None when the mode is Off or nothing is held.
    ///
    /// Up and Down move to the next octave after each full pass over the held
    /// notes. UpDown bounces between the lowest and highest note of the whole
    /// span without repeating either end.
    pub fn next_note(&mut self) -> Option<u8> {
        if self.held_notes.is_empty() {
            return None;
        }
        let len = self.sequence_len();
        if self.cursor >= len {
            self.cursor = 0;
        }

        match self.params.mode {
            ArpMode::Off => None,
            ArpMode::Up => {
                let pitch = self.sequence_pitch(self.cursor);
                self.cursor = (self.cursor + 1) % len;
                Some(pitch)
            }
            ArpMode::Down => {
                let pitch = self.sequence_pitch(len - 1 - self.cursor);
                self.cursor = (self.cursor + 1) % len;
                Some(pitch)
            }
            ArpMode::UpDown => {
                let pitch = self.sequence_pitch(self.cursor);
                if len > 1 {
                    if self.ascending && self.cursor + 1 == len {
                        self.ascending = false;
                    } else if !self.ascending && self.cursor == 0 {
                        self.ascending = true;
                    }
                    if self.ascending {
                        self.cursor += 1;
                    } else {
                        self.cursor -= 1;
                    }
                }
                Some(pitch)
            }
            ArpMode::Random => {
                let index = self.next_random(self.held_notes.len());
                let note = self.held_notes[index];
                let octave = self.next_random(usize::from(self.params.octaves)) as u16;
                Some((u16::from(note) + 12 * octave).min(127) as u8)
            }
        }
    }

    // ============================================================================
    // Timing
    // ============================================================================

    /// Step length in samples, always at least 1
    pub fn samples_per_step(&self, sample_rate: f64, bpm: f64) -> u32 {
        let rate = if self.params.rate <= 0.001 {
            f64::from(DEFAULT_RATE)
        } else {
            f64::from(self.params.rate)
        };
        let bpm = if bpm <= 0.001 { DEFAULT_BPM } else { bpm };

        let samples = if self.params.tempo_sync {
            (60.0 / bpm) * (1.0 / rate) * sample_rate
        } else {
            sample_rate / rate
        };
        let samples = if !(samples > 0.0) || samples > 10.0 * sample_rate {
            sample_rate / 4.0
        } else {
            samples
        };
        (samples as u32).max(1)
    }

    /// Note length in samples: gate fraction of the step, within `1..=step`
    pub fn gate_samples(&self, samples_per_step: u32) -> u32 {
        let step = samples_per_step.max(1);
        ((f64::from(step) * f64::from(self.params.gate)).floor() as u32).clamp(1, step)
    }

    /// Free-running step interval in milliseconds
    pub fn interval_ms(&self) -> f64 {
        1000.0 / f64::from(self.params.rate.max(MIN_RATE))
    }

    // ============================================================================
    // Processing
    // ============================================================================

    /// Process one block.
    ///
    /// Incoming note-ons and note-offs update the held set. While enabled the
    /// input is consumed and replaced by the arpeggiated events; while disabled
    /// the input passes through unchanged. Note-offs come before note-ons at
    /// the same offset. Step and gate lengths are taken from the parameters
    /// when each step starts, so changes never cut a sounding note short.
    pub fn process(
        &mut self,
        input: &[MidiEvent],
        num_samples: u32,
        sample_rate: f64,
        bpm: f64,
    ) -> Vec<MidiEvent> {
        if !self.params.enabled {
            return input.to_vec();
        }

        let mut output = Vec::new();
        for event in input {
            if event.is_note_off() {
                output.extend(self.remove_note(event.pitch));
            } else {
                self.add_note(event.pitch);
            }
        }

        if self.held_notes.is_empty() || self.params.mode == ArpMode::Off {
            output.extend(self.release(0));
            return output;
        }

        for offset in 0..num_samples {
            if self.step_due || self.sample_counter >= self.step_samples {
                self.step_due = false;
                self.sample_counter = 0;
                self.step_samples = self.samples_per_step(sample_rate, bpm);
                self.note_samples = self.gate_samples(self.step_samples);
                if let Some(pitch) = self.active_note.take() {
                    output.push(MidiEvent::note_off(pitch, offset));
                }
                if let Some(pitch) = self.next_note() {
                    output.push(MidiEvent::note_on(pitch, NOTE_VELOCITY, offset));
                    self.active_note = Some(pitch);
                }
            }
            if self.sample_counter >= self.note_samples {
                if let Some(pitch) = self.active_note.take() {
                    output.push(MidiEvent::note_off(pitch, offset));
                }
            }
            self.sample_counter += 1;
        }
        output
    }

    // ============================================================================
    // Parameters
    // ============================================================================

    pub fn params(&self) -> ArpParams {
        self.params
    }

    /// Replace every parameter at once. Returns the forced note-off when this disables.
    pub fn apply_params(&mut self, params: ArpParams) -> Option<MidiEvent> {
        let params = params.clamped();
        if params == self.params {
            return None;
        }
        let released = if self.params.enabled && !params.enabled {
            self.release(0)
        } else {
            None
        };
        self.params = params;
        self.notifier.notify(ArpeggiatorEvent::ParametersChanged);
        released
    }

    fn update(&mut self, change: impl FnOnce(&mut ArpParams)) {
        let mut params = self.params;
        change(&mut params);
        let params = params.clamped();
        if params != self.params {
            self.params = params;
            self.notifier.notify(ArpeggiatorEvent::ParametersChanged);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.params.enabled
    }

    /// Disabling silences the sounding note and keeps the held notes
    pub fn set_enabled(&mut self, enabled: bool) -> Option<MidiEvent> {
        if enabled == self.params.enabled {
            return None;
        }
        debug!(enabled, "arpeggiator toggled");
        let released = if enabled { None } else { self.release(0) };
        self.step_due = true;
        self.update(|p| p.enabled = enabled);
        released
    }

    pub fn toggle_enabled(&mut self) -> Option<MidiEvent> {
        self.set_enabled(!self.params.enabled)
    }

    pub fn mode(&self) -> ArpMode {
        self.params.mode
    }

    pub fn mode_name(&self) -> &'static str {
        self.params.mode.name()
    }

    pub fn set_mode(&mut self, mode: ArpMode) {
        self.update(|p| p.mode = mode);
    }

    pub fn increment_mode(&mut self) {
        self.set_mode(self.params.mode.next());
    }

    pub fn decrement_mode(&mut self) {
        self.set_mode(self.params.mode.previous());
    }

    pub fn is_tempo_sync(&self) -> bool {
        self.params.tempo_sync
    }

    pub fn set_tempo_sync(&mut self, tempo_sync: bool) {
        self.update(|p| p.tempo_sync = tempo_sync);
    }

    pub fn rate(&self) -> f32 {
        self.params.rate
    }

    pub fn set_rate(&mut self, rate: f32) {
        self.update(|p| p.rate = rate);
    }

    pub fn increment_rate(&mut self) {
        self.set_rate(self.params.rate + RATE_STEP);
    }

    pub fn decrement_rate(&mut self) {
        self.set_rate(self.params.rate - RATE_STEP);
    }

    pub fn gate(&self) -> f32 {
        self.params.gate
    }

    pub fn set_gate(&mut self, gate: f32) {
        self.update(|p| p.gate = gate);
    }

    pub fn increment_gate(&mut self) {
        self.set_gate(self.params.gate + GATE_STEP);
    }

    pub fn decrement_gate(&mut self) {
        self.set_gate(self.params.gate - GATE_STEP);
    }

    pub fn octaves(&self) -> u8 {
        self.params.octaves
    }

    pub fn set_octaves(&mut self, octaves: u8) {
        self.update(|p| p.octaves = octaves);
    }

    pub fn increment_octaves(&mut self) {
        self.set_octaves(self.params.octaves.saturating_add(1));
    }

    pub fn decrement_octaves(&mut self) {
        self.set_octaves(self.params.octaves.saturating_sub(1));
    }
}
