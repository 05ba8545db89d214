//! Transport state, controls and tempo

use serde::{Deserialize, Serialize};

/// Playback control offered by the host engine
pub trait TransportControl {
    fn is_playing(&self) -> bool;
    fn play(&mut self);
    fn stop(&mut self);
    /// Position in seconds
    fn position(&self) -> f64;
    fn set_position(&mut self, secs: f64);
    /// Loop playback between two timeline positions in seconds
    fn set_loop_range(&mut self, start_secs: f64, end_secs: f64);
}

/// Tempo lookup offered by the host engine
pub trait TempoSource {
    fn beats_per_second_at(&self, secs: f64) -> f64;
    /// Timeline position in seconds to beats since zero
    fn to_beats(&self, secs: f64) -> f64;

    fn bpm_at(&self, secs: f64) -> f64 {
        self.beats_per_second_at(secs) * 60.0
    }
}

/// Transport playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
}

/// Transport controls and position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transport {
    pub state: TransportState,
    /// Current position in samples
    pub position_samples: u64,
    /// Sample rate for time conversion
    pub sample_rate: u32,
    /// Tempo in BPM
    pub bpm: f64,
    /// Loop enabled
    pub loop_enabled: bool,
    /// Loop start in samples
    pub loop_start: u64,
    /// Loop end in samples
    pub loop_end: u64,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            state: TransportState::Stopped,
            position_samples: 0,
            sample_rate: 44100,
            bpm: 120.0,
            loop_enabled: false,
            loop_start: 0,
            loop_end: 0,
        }
    }
}

impl Transport {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Default::default()
        }
    }

    pub fn with_bpm(mut self, bpm: f64) -> Self {
        self.bpm = bpm;
        self
    }

    /// Position in seconds
    pub fn position_secs(&self) -> f64 {
        self.position_samples as f64 / self.sample_rate as f64
    }

    /// Set position from seconds
    pub fn set_position_secs(&mut self, secs: f64) {
        self.position_samples = self.secs_to_samples(secs);
    }

    fn secs_to_samples(&self, secs: f64) -> u64 {
        (secs.max(0.0) * self.sample_rate as f64) as u64
    }

    /// Advance position by given samples, handling loop
    pub fn advance(&mut self, samples: u64) {
        if !self.is_playing() {
            return;
        }
        self.position_samples += samples;

        if self.loop_enabled && self.position_samples >= self.loop_end && self.loop_end > self.loop_start {
            let overshoot = (self.position_samples - self.loop_end) % (self.loop_end - self.loop_start);
            self.position_samples = self.loop_start + overshoot;
        }
    }
}

impl TransportControl for Transport {
    fn is_playing(&self) -> bool {
        matches!(self.state, TransportState::Playing)
    }

    fn play(&mut self) {
        self.state = TransportState::Playing;
    }

    /// Halts playback and keeps the position
    fn stop(&mut self) {
        self.state = TransportState::Stopped;
    }

    fn position(&self) -> f64 {
        self.position_secs()
    }

    fn set_position(&mut self, secs: f64) {
        self.set_position_secs(secs);
    }

    fn set_loop_range(&mut self, start_secs: f64, end_secs: f64) {
        self.loop_start = self.secs_to_samples(start_secs);
        self.loop_end = self.secs_to_samples(end_secs);
        self.loop_enabled = self.loop_end > self.loop_start;
    }
}

/// Constant tempo across the whole timeline
impl TempoSource for Transport {
    fn beats_per_second_at(&self, _secs: f64) -> f64 {
        self.bpm / 60.0
    }

    fn to_beats(&self, secs: f64) -> f64 {
        secs * self.bpm / 60.0
    }
}
