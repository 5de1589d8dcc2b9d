//! Timing utilities
//!
//! - [`kernel_timer`] - event-based device timing and `Instant`-based host timing

pub mod kernel_timer;

pub use kernel_timer::{KernelTimer, ScopedTimer};
