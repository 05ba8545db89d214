//! Per-channel step pattern storage

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PulseGridError, Result};

/// Number of pitch lanes in a step sequence (two octaves)
pub const MAX_CHANNELS: usize = 24;
/// Number of measures a pattern can hold
pub const MAX_MEASURES: usize = 4;
/// Finest supported grid resolution
pub const MAX_NOTES_PER_MEASURE: usize = 16;
/// Bits used to encode one step's intensity
pub const INTENSITY_BITS: usize = 3;
/// Highest intensity a step can hold
pub const MAX_INTENSITY: u8 = 7;
/// Number of steps a pattern can hold at the finest resolution
pub const MAX_STEPS: usize = MAX_MEASURES * MAX_NOTES_PER_MEASURE;
/// Total width of a channel pattern in bits
pub const PATTERN_BITS: usize = MAX_STEPS * INTENSITY_BITS;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = PATTERN_BITS / WORD_BITS;

/// Fixed-width intensity pattern.
///
/// Step `i` occupies bits `3i..3i + 3`, least significant bit first. Steps
/// beyond [MAX_STEPS] do not exist: writes are dropped and reads return 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StepPattern {
    words: [u64; WORDS],
}

impl StepPattern {
    pub const fn empty() -> Self {
        Self { words: [0; WORDS] }
    }

    fn bit(&self, pos: usize) -> bool {
        (self.words[pos / WORD_BITS] >> (pos % WORD_BITS)) & 1 == 1
    }

    fn set_bit(&mut self, pos: usize, value: bool) {
        let mask = 1u64 << (pos % WORD_BITS);
        if value {
            self.words[pos / WORD_BITS] |= mask;
        } else {
            self.words[pos / WORD_BITS] &= !mask;
        }
    }

    /// Intensity (0-7) stored at a step; 0 for steps outside the pattern
    pub fn intensity(&self, note_index: usize) -> u8 {
        if note_index >= MAX_STEPS {
            return 0;
        }
        let base = note_index * INTENSITY_BITS;
        (0..INTENSITY_BITS).fold(0u8, |acc, b| acc | (u8::from(self.bit(base + b)) << b))
    }

    /// Store an intensity at a step. Returns false when the step is beyond capacity.
    /// Values above [MAX_INTENSITY] are clamped.
    pub fn set_intensity(&mut self, note_index: usize, value: u8) -> bool {
        if note_index >= MAX_STEPS {
            return false;
        }
        let value = value.min(MAX_INTENSITY);
        let base = note_index * INTENSITY_BITS;
        for b in 0..INTENSITY_BITS {
            self.set_bit(base + b, (value >> b) & 1 == 1);
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn clear(&mut self) {
        self.words = [0; WORDS];
    }

    /// Steps with a nonzero intensity, in ascending order
    pub fn active_steps(&self) -> impl Iterator<Item = (usize, u8)> + '_ {
        (0..MAX_STEPS)
            .map(|i| (i, self.intensity(i)))
            .filter(|(_, v)| *v > 0)
    }

    /// Base-2 text, most significant bit first, without leading zeros ("0" when empty)
    pub fn to_binary_string(&self) -> String {
        let Some(top) = (0..PATTERN_BITS).rev().find(|&pos| self.bit(pos)) else {
            return "0".to_string();
        };
        (0..=top)
            .rev()
            .map(|pos| if self.bit(pos) { '1' } else { '0' })
            .collect()
    }

    /// Parse base-2 text written by [StepPattern::to_binary_string].
    ///
    /// Leading zeros are ignored. Text longer than [PATTERN_BITS] keeps its
    /// leading (highest) digits and drops the rest.
    pub fn from_binary_string(s: &str) -> Result<Self> {
        let digits = s.trim();
        if let Some(bad) = digits.chars().find(|c| *c != '0' && *c != '1') {
            return Err(PulseGridError::InvalidPattern(format!(
                "unexpected character {bad:?} in {digits:?}"
            )));
        }

        let significant = digits.trim_start_matches('0');
        let kept = if significant.len() > PATTERN_BITS {
            warn!(
                len = significant.len(),
                max = PATTERN_BITS,
                "pattern exceeds capacity, truncating"
            );
            &significant[..PATTERN_BITS]
        } else {
            significant
        };

        let mut pattern = Self::empty();
        for (pos, c) in kept.chars().rev().enumerate() {
            pattern.set_bit(pos, c == '1');
        }
        Ok(pattern)
    }
}

impl From<StepPattern> for String {
    fn from(pattern: StepPattern) -> Self {
        pattern.to_binary_string()
    }
}

impl TryFrom<String> for StepPattern {
    type Error = PulseGridError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_binary_string(&value)
    }
}

/// One pitch lane of the step grid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepChannel {
    index: usize,
    pattern: StepPattern,
}

impl StepChannel {
    /// Create an empty channel; the index is clamped into `0..MAX_CHANNELS`
    pub fn new(index: usize) -> Self {
        if index >= MAX_CHANNELS {
            warn!(index, "channel index out of range, clamping");
        }
        Self {
            index: index.min(MAX_CHANNELS - 1),
            pattern: StepPattern::empty(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pattern(&self) -> StepPattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: StepPattern) {
        self.pattern = pattern;
    }

    /// Set the note intensity between 0 & 7
    pub fn set_note(&mut self, note_index: usize, intensity: u8) {
        if intensity > MAX_INTENSITY {
            warn!(channel = self.index, intensity, "intensity out of range, clamping");
        }
        self.pattern.set_intensity(note_index, intensity);
    }

    /// Return the note intensity between 0 & 7
    pub fn note(&self, note_index: usize) -> u8 {
        self.pattern.intensity(note_index)
    }

    pub fn has_note(&self, note_index: usize) -> bool {
        self.note(note_index) > 0
    }

    pub fn clear(&mut self) {
        self.pattern.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// Number of steps available at a grid resolution (always four measures)
    pub fn max_number_of_notes(notes_per_measure: usize) -> usize {
        MAX_MEASURES * notes_per_measure
    }
}
