//! Error types for pulsegrid

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PulseGridError {
    #[error("Invalid pattern string: {0}")]
    InvalidPattern(String),
    #[error("Channel index out of range: {0}")]
    ChannelOutOfRange(usize),
    #[error("Unsupported notes per measure: {0}")]
    UnsupportedNotesPerMeasure(usize),
    #[error("Unknown arpeggiator mode: {0}")]
    UnknownArpMode(String),
}

pub type Result<T> = std::result::Result<T, PulseGridError>;
