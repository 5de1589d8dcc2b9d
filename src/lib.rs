//! mlpforge - arena-backed fused MLP training core
//!
//! Two coupled subsystems:
//! - [`memory`]: deferred-allocation arenas that pack many tensors into one
//!   device block per category and hand out typed [`tensor::TensorView`]s
//! - [`mlp`]: a fused linear/bias/activation stage chain with per-shape GEMM
//!   algorithm search and capture/replay of whole training steps
//!
//! Both run on the device abstractions in [`backend`] (streams, events,
//! execution graphs). Kernel numerics go through the [`kernels::GemmProvider`]
//! math-library interface.

#![allow(clippy::too_many_arguments)] // Kernel launches need many args
#![allow(clippy::needless_range_loop)] // Clearer for index-heavy kernels

pub mod backend;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod memory;
pub mod mlp;
pub mod profiling;
pub mod tensor;

pub use backend::{Device, DeviceEvent, DeviceStream, ExecutionGraph, Placement, QueueId};
pub use error::{ErrorCategory, MlpForgeError, MlpResult};
pub use kernels::{Activation, GemmProvider, HostBlas, KernelTuning};
pub use logging::{init_logging_default, init_with_config, LoggingConfig};
pub use memory::{AllocatorKind, ArenaSet, BlockAllocatorStrategy, MemoryArena, TensorCategory};
pub use mlp::{MlpEngine, NetworkDesc, Precision, StageDesc, StepOutcome};
pub use profiling::{KernelTimer, ScopedTimer};
pub use tensor::{DType, Scalar, TensorView};
