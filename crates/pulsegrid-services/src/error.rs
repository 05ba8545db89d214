//! Error types for the service layer

use pulsegrid_core::{NotEditable, PulseGridError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Command queue full")]
    QueueFull,
    #[error("Processor disconnected")]
    Disconnected,
    #[error("Clip not editable on the step grid: {0}")]
    NotEditable(String),
    #[error(transparent)]
    Core(#[from] PulseGridError),
}

impl<C> From<NotEditable<C>> for ServiceError {
    fn from(rejected: NotEditable<C>) -> Self {
        Self::NotEditable(rejected.reason.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
