//! Compute kernels launched by the MLP engine
//!
//! - `gemm`: the math-library interface (`GemmProvider`) and its host implementation
//! - `fused`: bias, activation and reduction epilogues
//! - `tuning`: the GEMM algorithm candidate set and search configuration
//! - `launch`: enqueue helpers that bind tensor views to stream ops

pub mod fused;
pub mod gemm;
pub mod launch;
pub mod tuning;

pub use fused::Activation;
pub use gemm::{GemmAlgorithm, GemmDesc, GemmProvider, HostBlas, MathMode};
pub use launch::{
    launch_activation_backward, launch_bias_activation, launch_column_sum, launch_gemm,
    GemmOperands,
};
pub use tuning::KernelTuning;
