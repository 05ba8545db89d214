//! Fixed set of step channels, one per semitone of a two-octave window

use serde::{Deserialize, Serialize};

use crate::error::{PulseGridError, Result};
use crate::step_channel::{StepChannel, MAX_CHANNELS};

/// All 24 channels of a step grid.
///
/// Persisted as a list of channels keyed by their index, so a restored list
/// may be partial or unordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<StepChannel>", try_from = "Vec<StepChannel>")]
pub struct StepSequence {
    channels: [StepChannel; MAX_CHANNELS],
}

impl Default for StepSequence {
    fn default() -> Self {
        Self {
            channels: std::array::from_fn(StepChannel::new),
        }
    }
}

impl StepSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, index: usize) -> Option<&StepChannel> {
        self.channels.get(index)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut StepChannel> {
        self.channels.get_mut(index)
    }

    pub fn channels(&self) -> impl Iterator<Item = &StepChannel> {
        self.channels.iter()
    }

    /// Reset every pattern to zero; channel count and indices are untouched
    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(StepChannel::is_empty)
    }

    /// Intensity at a cell, 0 for an unknown channel
    pub fn note(&self, channel: usize, note_index: usize) -> u8 {
        self.channel(channel).map_or(0, |c| c.note(note_index))
    }

    /// Every nonzero cell as `(channel, note_index, intensity)`
    pub fn active_cells(&self) -> impl Iterator<Item = (usize, usize, u8)> + '_ {
        self.channels.iter().flat_map(|channel| {
            channel
                .pattern()
                .active_steps()
                .map(move |(step, intensity)| (channel.index(), step, intensity))
                .collect::<Vec<_>>()
        })
    }
}

impl From<StepSequence> for Vec<StepChannel> {
    fn from(sequence: StepSequence) -> Self {
        sequence.channels.into()
    }
}

impl TryFrom<Vec<StepChannel>> for StepSequence {
    type Error = PulseGridError;

    fn try_from(channels: Vec<StepChannel>) -> Result<Self> {
        let mut sequence = Self::default();
        for channel in channels {
            let slot = sequence
                .channel_mut(channel.index())
                .ok_or(PulseGridError::ChannelOutOfRange(channel.index()))?;
            slot.set_pattern(channel.pattern());
        }
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_are_indexed() {
        let sequence = StepSequence::new();
        assert_eq!(sequence.channels().count(), MAX_CHANNELS);
        for (i, channel) in sequence.channels().enumerate() {
            assert_eq!(channel.index(), i);
        }
        assert!(sequence.channel(MAX_CHANNELS).is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut sequence = StepSequence::new();
        sequence.channel_mut(0).unwrap().set_note(0, 7);
        sequence.channel_mut(23).unwrap().set_note(63, 3);

        sequence.clear();
        let once = sequence.clone();
        sequence.clear();

        assert_eq!(sequence, once);
        assert!(sequence.is_empty());
        assert_eq!(sequence.channels().count(), MAX_CHANNELS);
    }

    #[test]
    fn test_active_cells() {
        let mut sequence = StepSequence::new();
        sequence.channel_mut(2).unwrap().set_note(5, 3);
        sequence.channel_mut(0).unwrap().set_note(9, 7);

        let cells: Vec<_> = sequence.active_cells().collect();
        assert_eq!(cells, vec![(0, 9, 7), (2, 5, 3)]);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut sequence = StepSequence::new();
        sequence.channel_mut(4).unwrap().set_note(12, 5);
        sequence.channel_mut(17).unwrap().set_note(40, 7);

        let json = serde_json::to_string(&sequence).unwrap();
        let restored: StepSequence = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, sequence);
    }

    #[test]
    fn test_restore_rejects_unknown_channel() {
        let json = r#"[{"index": 30, "pattern": "111"}]"#;
        assert!(serde_json::from_str::<StepSequence>(json).is_err());
    }
}
