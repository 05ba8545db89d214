//! pulsegrid-services: Realtime arpeggiator, live note routing and sessions

mod error;
pub mod live;
pub mod realtime;
pub mod session;

pub use error::{Result, ServiceError};
pub use live::{ChannelNoteSink, InjectedNote, LiveNoteRouter};
pub use realtime::{
    arpeggiator_channel, ArpeggiatorHandle, ArpeggiatorProcessor, NoteCommand, SharedArpParams,
};
pub use session::Session;
