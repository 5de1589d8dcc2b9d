//! Unified error handling for mlpforge
//!
//! Every fallible operation above the device layer returns [`MlpForgeError`].
//! Errors are grouped into categories that drive handling decisions:
//! - Configuration errors (bad shapes, sizes, alignments, network descriptions)
//! - Allocation errors (device memory exhausted, double release)
//! - State errors (operation called in the wrong lifecycle phase)
//! - Device execution errors (failures reported by asynchronously run kernels)
//! - Internal errors (bugs, poisoned locks, I/O)

use std::fmt;

use crate::backend::device::{DeviceError, Placement};

/// Unified error type for mlpforge
#[derive(Debug, thiserror::Error)]
pub enum MlpForgeError {
    // ========== Configuration Errors ==========
    /// Shapes or widths do not line up
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A zero or overflowing size was requested
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    /// Alignment is not a power of two (or too small for the element type)
    #[error("Invalid alignment: {0}")]
    InvalidAlignment(usize),

    /// Invalid engine or network configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Network description could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    // ========== Allocation Errors ==========
    /// Allocation strategy could not satisfy the request
    #[error("Out of {placement} memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        requested: usize,
        available: usize,
        placement: Placement,
    },

    /// Memory released twice
    #[error("Double free: {0}")]
    DoubleFree(String),

    // ========== State Errors ==========
    /// Arena was already sealed (or already released)
    #[error("Arena '{0}' is already sealed")]
    AlreadySealed(String),

    /// Arena has not been sealed yet
    #[error("Arena '{0}' is not sealed")]
    NotSealed(String),

    /// Arena memory has been released; views into it are dead
    #[error("Arena '{0}' has been released")]
    ArenaReleased(String),

    /// `backward` called without a preceding training `forward`
    #[error("Backward pass requires a preceding training forward pass")]
    BackwardWithoutForward,

    /// Engine used before `initialize`
    #[error("MLP engine not initialized")]
    EngineNotInitialized,

    /// Any other lifecycle violation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ========== Device Errors ==========
    /// Failure reported by the device layer
    #[error("Device error: {0}")]
    Device(DeviceError),

    // ========== Internal Errors ==========
    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Lock poisoned (indicates a bug or a panicking thread)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl MlpForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            MlpForgeError::ShapeMismatch(_)
            | MlpForgeError::InvalidSize(_)
            | MlpForgeError::InvalidAlignment(_)
            | MlpForgeError::InvalidConfiguration(_)
            | MlpForgeError::ConfigParse(_) => ErrorCategory::Configuration,

            MlpForgeError::OutOfMemory { .. } | MlpForgeError::DoubleFree(_) => {
                ErrorCategory::Allocation
            }

            MlpForgeError::AlreadySealed(_)
            | MlpForgeError::NotSealed(_)
            | MlpForgeError::ArenaReleased(_)
            | MlpForgeError::BackwardWithoutForward
            | MlpForgeError::EngineNotInitialized
            | MlpForgeError::InvalidState(_) => ErrorCategory::State,

            MlpForgeError::Device(_) => ErrorCategory::DeviceExecution,

            MlpForgeError::IoError(_)
            | MlpForgeError::LockPoisoned(_)
            | MlpForgeError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// Allocation failures may succeed once other arenas are released.
    ///
    /// Nothing in this crate retries on its own; this is a hint for callers.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MlpForgeError::OutOfMemory { .. })
    }

    /// Check if this is a caller error (bad input or wrong call order)
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::State
        )
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input: shapes, sizes, alignments, descriptions
    Configuration,
    /// Memory could not be obtained or was released incorrectly
    Allocation,
    /// Operation not valid in the current lifecycle phase
    State,
    /// Failure inside asynchronously executed device work
    DeviceExecution,
    /// Bug or environment failure
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Allocation => write!(f, "Allocation"),
            ErrorCategory::State => write!(f, "State"),
            ErrorCategory::DeviceExecution => write!(f, "DeviceExecution"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

// Allocation failures keep their category when they cross the device boundary.
impl From<DeviceError> for MlpForgeError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory {
                requested,
                available,
                placement,
            } => MlpForgeError::OutOfMemory {
                requested,
                available,
                placement,
            },
            DeviceError::DoubleFree(id) => {
                MlpForgeError::DoubleFree(format!("device block {} released twice", id))
            }
            DeviceError::LockPoisoned(msg) => MlpForgeError::LockPoisoned(msg),
            other => MlpForgeError::Device(other),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for MlpForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MlpForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type MlpResult<T> = std::result::Result<T, MlpForgeError>;

/// Create a shape mismatch error with context
///
/// # Examples
/// ```ignore
/// return Err(shape_error!("expected {} elements, got {}", expected, actual));
/// ```
#[macro_export]
macro_rules! shape_error {
    ($msg:expr) => {
        $crate::error::MlpForgeError::ShapeMismatch($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MlpForgeError::ShapeMismatch(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::MlpForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MlpForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Wrap an IO error with the operation that failed
///
/// # Examples
/// ```ignore
/// let text = std::fs::read_to_string(path).map_err(|e| io_context(e, "reading network description"))?;
/// ```
pub fn io_context(err: std::io::Error, msg: &str) -> MlpForgeError {
    MlpForgeError::IoError(std::io::Error::new(
        err.kind(),
        format!("{}: {}", msg, err),
    ))
}
