//! Encoder controller error types.
//!
//! The taxonomy is closed: every operation of the controller maps its
//! failures onto one of these kinds.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, HevcError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HevcError {
    /// Malformed request, caught before anything is submitted.
    #[error("bad parameter")]
    BadParameter,
    /// Device absent or could not be brought up.
    #[error("no device")]
    NoDevice,
    /// Device not in a live main state.
    #[error("device in bad state")]
    BadState,
    /// Task ring or buffer pool exhausted, including after a bounded wait.
    #[error("resource busy")]
    Busy,
    /// Ack or result not observed within the wait window.
    #[error("operation timed out")]
    Timeout,
    /// Hardware reported a failed DMA transfer.
    #[error("dma transfer failed")]
    DmaFailed,
    /// Hardware reported a failed command.
    #[error("i/o error")]
    IoError,
    /// Stuck slot force-completed by the orphan sweep.
    #[error("orphaned task")]
    OrphanedTask,
}

impl HevcError {
    /// Short static description, usable where formatting is unavailable.
    pub const fn description(&self) -> &'static str {
        match self {
            Self::BadParameter => "bad parameter",
            Self::NoDevice => "no device",
            Self::BadState => "device in bad state",
            Self::Busy => "resource busy",
            Self::Timeout => "operation timed out",
            Self::DmaFailed => "dma transfer failed",
            Self::IoError => "i/o error",
            Self::OrphanedTask => "orphaned task",
        }
    }

    /// Whether the marshaling layer may retry the request as is.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::Timeout)
    }
}
