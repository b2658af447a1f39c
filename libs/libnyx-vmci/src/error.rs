//! Error types for VMCI transport operations

use thiserror::Error;

/// VMCI transport errors.
///
/// The variants are error *kinds*: callers branch on them to decide between
/// retrying, dropping, or escalating to a channel state transition.
#[derive(Debug, Error)]
pub enum VmciError {
    /// Malformed handle, size or flags (caller bug, never retried).
    #[error("Invalid arguments: {0}")]
    InvalidArgs(&'static str),

    /// Queue pair exists but its memory was never mapped.
    #[error("Queue pair not attached")]
    NotAttached,

    /// Queue pair memory was mapped before and is currently gone.
    #[error("Queue pair not ready")]
    NotReady,

    /// Queue pair has been fully detached.
    #[error("Queue pair detached")]
    Detached,

    /// Produce queue is full.
    #[error("Queue pair has no space")]
    NoSpace,

    /// Consume queue is empty.
    #[error("Queue pair has no data")]
    NoData,

    /// A shared header offset is outside the queue (corruption).
    #[error("Queue header offset out of range: {offset} >= {size}")]
    InvalidSize { offset: u64, size: u64 },

    /// Allocation failure or resource ceiling reached.
    #[error("Out of memory: {0}")]
    NoMem(&'static str),

    /// Routing dead end.
    #[error("Destination unreachable")]
    Unreachable,

    /// Neither the guest nor the host personality can service the request.
    #[error("Device not found")]
    DeviceNotFound,

    /// Object already created or attached.
    #[error("Already exists")]
    AlreadyExists,

    /// Handle already registered.
    #[error("Duplicate entry")]
    DuplicateEntry,

    /// No resource registered under the handle.
    #[error("Not found")]
    NotFound,

    /// Privilege flags forbid the interaction.
    #[error("Access denied")]
    NoAccess,

    /// Datagram payload above the transport limit.
    #[error("Payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Operation not permitted in the current channel state.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Malformed packet or datagram on the wire.
    #[error("Protocol error: {0}")]
    Protocol(&'static str),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for VMCI operations.
pub type Result<T> = std::result::Result<T, VmciError>;

impl VmciError {
    /// Transient failures that may succeed once memory is (re)mapped.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotAttached | Self::NotReady)
    }

    /// Shared state was found inconsistent; never retry blindly.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::InvalidSize { .. })
    }

    /// Normal flow-control outcomes, not worth logging as errors.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::NoSpace | Self::NoData)
    }

    /// Stable numeric code, shared with the device ABI.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgs(_) => -2,
            Self::NoMem(_) => -3,
            Self::DuplicateEntry => -9,
            Self::Unreachable => -10,
            Self::PayloadTooLarge { .. } => -11,
            Self::NoAccess => -12,
            Self::InvalidState(_) | Self::Config(_) | Self::Io(_) => -13,
            Self::NotFound => -21,
            Self::AlreadyExists => -22,
            Self::InvalidSize { .. } => -24,
            Self::Protocol(_) => -27,
            Self::NotAttached | Self::Detached => -34,
            Self::NoSpace => -35,
            Self::NoData => -36,
            Self::DeviceNotFound => -39,
            Self::NotReady => -40,
        }
    }
}
