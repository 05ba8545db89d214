//! pulsegrid-core: Step sequencer and arpeggiator engines

pub mod arpeggiator;
mod clip;
mod error;
mod midi;
mod notify;
pub mod step_channel;
mod step_sequence;
pub mod step_sequencer;
mod transport;

pub use arpeggiator::{ArpMode, ArpParams, Arpeggiator, ArpeggiatorEvent};
pub use clip::{ClipId, MidiClip, MidiNote, NoteContainer};
pub use error::{PulseGridError, Result};
pub use midi::{LiveNoteSink, MidiEvent, SourceId};
pub use notify::Notifier;
pub use step_channel::{StepChannel, StepPattern};
pub use step_sequence::StepSequence;
pub use step_sequencer::{
    intensity_to_velocity, next_intensity, velocity_to_intensity,
    CopiedNote, NotEditable, NotEditableReason, StepSequencer, StepSequencerEvent, StepSequencerState,
};
pub use transport::{TempoSource, Transport, TransportControl, TransportState};
