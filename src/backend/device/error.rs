//! Device error types

use thiserror::Error;

use super::memory::Placement;

/// Errors raised by the device layer
///
/// `Clone` because a failure inside an asynchronously executed op is stored
/// once and handed back to every later `synchronize` caller.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("Device initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Out of {placement} memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        requested: usize,
        available: usize,
        placement: Placement,
    },
    #[error("Invalid allocation: {0}")]
    InvalidAllocation(String),
    #[error("Block {0} released twice")]
    DoubleFree(u64),
    #[error("Kernel '{kernel}' failed: {reason}")]
    ExecutionFailed { kernel: String, reason: String },
    #[error("Event error: {0}")]
    EventError(String),
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Capture error: {0}")]
    CaptureError(String),
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DeviceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeviceError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Device result type
pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    /// Build an execution failure for the named kernel
    pub fn execution(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        DeviceError::ExecutionFailed {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    /// Only memory exhaustion can clear up without a code change.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeviceError::OutOfMemory { .. })
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}
