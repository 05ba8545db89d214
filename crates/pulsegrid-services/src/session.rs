//! Headless session: one transport, one step sequencer, one clip at a time

use pulsegrid_core::{
    ClipId, MidiClip, NotEditable, StepSequencer, TempoSource, Transport, TransportControl,
};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Length of a new clip in beats (four measures)
const NEW_CLIP_BEATS: f64 = 16.0;

/// Wires a [StepSequencer] to an in-memory [Transport].
///
/// Stands in for a host engine: it owns the clip while the sequencer edits it
/// and forwards transport changes to the sequencer as the host would.
#[derive(Debug)]
pub struct Session {
    transport: Transport,
    sequencer: StepSequencer<MidiClip>,
    next_clip_id: u64,
}

impl Session {
    pub fn new(sample_rate: u32, bpm: f64) -> Self {
        Self {
            transport: Transport::new(sample_rate).with_bpm(bpm),
            sequencer: StepSequencer::new(),
            next_clip_id: 1,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn sequencer(&self) -> &StepSequencer<MidiClip> {
        &self.sequencer
    }

    pub fn sequencer_mut(&mut self) -> &mut StepSequencer<MidiClip> {
        &mut self.sequencer
    }

    /// Open a clip on the step grid, returning the clip it replaces.
    ///
    /// A rejected clip is handed back and the previous clip stays open.
    pub fn open_clip(
        &mut self,
        clip: MidiClip,
    ) -> std::result::Result<Option<MidiClip>, NotEditable<MidiClip>> {
        if self.transport.is_playing() {
            self.transport.stop();
        }
        self.sequencer.transport_state_changed(false);
        let id = clip.id;
        let previous = self.sequencer.bind(clip, &self.transport)?;
        info!(clip = id.0, "opened clip on step grid");
        Ok(previous)
    }

    /// Create an empty four-measure clip at the playhead and open it
    pub fn new_clip(&mut self) -> Result<ClipId> {
        let id = ClipId(self.next_clip_id);
        self.next_clip_id += 1;

        let start = self.transport.position();
        let end = start + NEW_CLIP_BEATS / self.transport.beats_per_second_at(start);
        self.open_clip(MidiClip::new(id, start, end))?;
        Ok(id)
    }

    /// Stop playback and hand back the open clip with the grid written to it
    pub fn close_clip(&mut self) -> Option<MidiClip> {
        if self.transport.is_playing() {
            self.transport.stop();
        }
        self.sequencer.transport_state_changed(false);
        let clip = self.sequencer.unbind()?;
        debug!(clip = clip.id.0, notes = clip.notes.len(), "closed clip");
        Some(clip)
    }

    pub fn play(&mut self) {
        self.sequencer.play(&mut self.transport);
    }

    pub fn stop(&mut self) {
        self.sequencer.stop(&mut self.transport);
    }

    /// Advance the playhead and let the cursor follow it
    pub fn advance(&mut self, frames: u64) {
        self.sync_loop_range();
        self.transport.advance(frames);
        let playing = self.transport.is_playing();
        self.sequencer.transport_state_changed(playing);
        if playing {
            self.sequencer
                .playback_position_changed(self.transport.position(), &self.transport);
        }
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        if !(bpm > 0.0) {
            warn!(bpm, "ignoring non-positive tempo");
            return;
        }
        self.transport.bpm = bpm;
        self.sequencer.tempo_changed(&self.transport);
        self.sync_loop_range();
        debug!(bpm, "tempo changed");
    }

    /// Keep an active loop on the clip span after the clip length changed
    fn sync_loop_range(&mut self) {
        if !self.transport.loop_enabled {
            return;
        }
        if let Some((start, end)) = self.sequencer.loop_range() {
            self.transport.set_loop_range(start, end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsegrid_core::{MidiNote, NoteContainer};

    #[test]
    fn test_new_clip_spans_four_measures() {
        let mut session = Session::new(48000, 120.0);
        let id = session.new_clip().unwrap();
        assert_eq!(id, ClipId(1));
        assert_eq!(session.sequencer().loop_range(), Some((0.0, 8.0)));
        assert_eq!(session.sequencer().number_of_notes(), 64);
    }

    #[test]
    fn test_rejected_clip_keeps_previous_open() {
        let mut session = Session::new(48000, 120.0);
        session.new_clip().unwrap();
        session.sequencer_mut().set_note_intensity(2, 0, 7);

        let wide = MidiClip::new(ClipId(9), 0.0, 8.0).with_notes([
            MidiNote::new(30, 100, 0.0, 0.25),
            MidiNote::new(90, 100, 0.0, 0.25),
        ]);
        let rejected = session.open_clip(wide).unwrap_err();
        assert_eq!(rejected.clip.id, ClipId(9));

        let clip = session.sequencer().clip().unwrap();
        assert_eq!(clip.id, ClipId(1));
        assert_eq!(session.sequencer().note_intensity_at(2, 0), 7);
    }

    #[test]
    fn test_advance_moves_cursor_while_playing() {
        let mut session = Session::new(1000, 120.0);
        session.new_clip().unwrap();
        session.play();
        // one beat = 500 frames = 4 steps at 16 notes per measure
        session.advance(500);
        assert_eq!(session.sequencer().selected_note_index(), 4);
        assert!(session.sequencer().is_playing());

        session.stop();
        session.advance(500);
        assert_eq!(session.sequencer().selected_note_index(), 4);
        assert!(!session.sequencer().is_playing());
    }

    #[test]
    fn test_loop_follows_clip_length() {
        let mut session = Session::new(1000, 120.0);
        session.new_clip().unwrap();
        session.play();
        session.sequencer_mut().set_number_of_notes(16);
        session.advance(1500);
        // 16 steps at 16 notes per measure = 2 s loop
        assert_eq!(session.transport().loop_end, 2000);
        assert_eq!(session.transport().position_samples, 1500);
        session.advance(600);
        assert_eq!(session.transport().position_samples, 100);
    }

    #[test]
    fn test_tempo_change_rescales_open_clip() {
        let mut session = Session::new(48000, 120.0);
        session.new_clip().unwrap();
        session.set_bpm(60.0);
        assert_eq!(session.sequencer().loop_range(), Some((0.0, 16.0)));
        session.set_bpm(-1.0);
        assert_eq!(session.transport().bpm, 60.0);
    }

    #[test]
    fn test_close_returns_edited_clip() {
        let mut session = Session::new(48000, 120.0);
        session.new_clip().unwrap();
        session.sequencer_mut().set_note_intensity(0, 4, 5);

        let clip = session.close_clip().unwrap();
        assert_eq!(clip.notes(), vec![MidiNote::new(53, 90, 1.0, 0.25)]);
        assert!(session.close_clip().is_none());
    }
}
