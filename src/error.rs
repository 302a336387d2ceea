//! Error type of the timing core

use thiserror::Error;

/// An error that can occur while configuring or driving the timing core
///
/// Transient radio conditions (timeouts, unsolicited frames, late
/// transmissions) are not errors at this level. They are counted in the
/// statistics of the module that observed them.
#[derive(Debug, Error)]
pub enum Error {
    /// The CCP period is zero or not a multiple of the epoch granularity
    #[error("period {period_uus:#x} uus is not a non-zero multiple of {granularity:#x}")]
    InvalidPeriod {
        /// The rejected period
        period_uus: u32,
        /// The required granularity
        granularity: u32,
    },

    /// A TDMA instance needs at least one slot
    #[error("invalid slot count {0}")]
    InvalidSlotCount(u16),

    /// Slot index outside of `0..nslots`
    #[error("slot {idx} out of range (nslots = {nslots})")]
    SlotOutOfRange {
        /// The requested slot
        idx: u16,
        /// Number of slots in the superframe
        nslots: u16,
    },

    /// The requested role change is not allowed in the current state
    #[error("role transition not allowed while running")]
    InvalidRoleTransition,

    /// No entry exists for the requested key
    #[error("not found")]
    NotFound,

    /// A fixed-capacity table is full
    #[error("no memory")]
    NoMemory,

    /// An argument was outside its domain
    #[error("invalid argument")]
    InvalidArgument,

    /// Buffer too small
    #[error("buffer too small, {required_len} bytes required")]
    BufferTooSmall {
        /// Indicates how large a buffer would have been required
        required_len: usize,
    },

    /// The frame carries a ranging code this crate doesn't know
    #[error("unknown frame code {0:#06x}")]
    UnknownFrameCode(u16),

    /// An error occured while serializing or deserializing a frame
    #[error("frame codec error: {0:?}")]
    Ssmarshal(ssmarshal::Error),

    /// The radio driver reported a failure
    #[error("radio error: {0}")]
    Radio(String),

    /// An exchange or transaction is already in progress
    #[error("resource busy")]
    Busy,
}

impl From<ssmarshal::Error> for Error {
    fn from(error: ssmarshal::Error) -> Self {
        Error::Ssmarshal(error)
    }
}
