//! Forwarding arpeggiator output to a live note target

use crossbeam_channel::{bounded, Receiver, Sender};
use pulsegrid_core::{LiveNoteSink, MidiEvent, SourceId};

/// Sends every event of a block to a [LiveNoteSink], tagged with one source
#[derive(Debug)]
pub struct LiveNoteRouter<S: LiveNoteSink> {
    sink: S,
    source: SourceId,
}

impl<S: LiveNoteSink> LiveNoteRouter<S> {
    pub fn new(sink: S, source: SourceId) -> Self {
        Self { sink, source }
    }

    pub fn route(&mut self, events: &[MidiEvent]) {
        for event in events {
            self.sink
                .inject_note(event.pitch, event.velocity, !event.is_note_off(), self.source);
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

/// A note injected through [ChannelNoteSink]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedNote {
    pub pitch: u8,
    pub velocity: u8,
    pub is_note_on: bool,
    pub source: SourceId,
}

/// Live note sink backed by a bounded channel; notes that don't fit are dropped
#[derive(Debug)]
pub struct ChannelNoteSink {
    tx: Sender<InjectedNote>,
    dropped: u64,
}

impl ChannelNoteSink {
    pub fn new(capacity: usize) -> (Self, Receiver<InjectedNote>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx, dropped: 0 }, rx)
    }

    /// Notes lost to a full or disconnected channel
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl LiveNoteSink for ChannelNoteSink {
    fn inject_note(&mut self, pitch: u8, velocity: u8, is_note_on: bool, source: SourceId) {
        let note = InjectedNote {
            pitch,
            velocity,
            is_note_on,
            source,
        };
        if self.tx.try_send(note).is_err() {
            self.dropped += 1;
        }
    }
}
