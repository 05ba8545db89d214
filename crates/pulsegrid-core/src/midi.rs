//! Note events and the live note injection seam

/// A note event positioned within a processing block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
    pub sample_offset: u32,
    pub is_note_on: bool,
}

impl MidiEvent {
    pub fn note_on(pitch: u8, velocity: u8, sample_offset: u32) -> Self {
        Self {
            pitch,
            velocity,
            channel: 0,
            sample_offset,
            is_note_on: true,
        }
    }

    pub fn note_off(pitch: u8, sample_offset: u32) -> Self {
        Self {
            pitch,
            velocity: 0,
            channel: 0,
            sample_offset,
            is_note_on: false,
        }
    }

    /// Note-on with velocity 0 counts as a note-off
    pub fn is_note_off(&self) -> bool {
        !self.is_note_on || self.velocity == 0
    }
}

/// Identifies who injected a live note, so the host can pair ons with offs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceId(pub u32);

/// Real-time note injection into the host engine, bypassing any clip
pub trait LiveNoteSink {
    fn inject_note(&mut self, pitch: u8, velocity: u8, is_note_on: bool, source: SourceId);
}
