//! Fused multi-layer perceptron
//!
//! A network is a chain of stages, each `activation(input x weight + bias)`.
//! The engine reserves all of its tensors from an [`crate::memory::ArenaSet`],
//! so it can only run once the caller has sealed the arenas:
//!
//! ```rust,ignore
//! let mut arenas = ArenaSet::new(&device, AllocatorKind::DevicePrimary);
//! let mut engine = MlpEngine::<f32>::new(desc, &mut arenas)?;
//! arenas.seal_all()?;
//! engine.initialize(&stream)?;
//!
//! engine.input().upload(&stream, &batch)?;
//! engine.forward(&stream, true)?;
//! engine.output_grad().upload(&stream, &loss_grad)?;
//! engine.backward(&stream)?;
//! stream.synchronize()?;
//! ```

pub mod config;
pub mod engine;
pub mod replay;
pub mod search;
pub mod stage;

pub use config::{Initializer, NetworkDesc, Precision, StageDesc};
pub use engine::MlpEngine;
pub use replay::{StageSignature, StepOutcome, StepSignature};
pub use stage::{Stage, StageAlgorithms, StageKind};
