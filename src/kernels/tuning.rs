//! GEMM algorithm candidates and search tuning
//!
//! The candidate set is fixed per provider build. Each candidate is a tile
//! configuration of the same kernel, so every candidate computes
//! bit-identical results and the search only picks the fastest.
//!
//! ```rust,ignore
//! use mlpforge::kernels::KernelTuning;
//!
//! let tuning = KernelTuning::from_env();
//! tuning.validate()?;
//! assert_eq!(tuning.candidates.len(), 6);
//! ```

use std::env;

use crate::error::{MlpForgeError, MlpResult};
use crate::kernels::gemm::GemmAlgorithm;

/// Force one candidate id and skip timing
pub const GEMM_ALGO_ENV: &str = "MLPFORGE_GEMM_ALGO";
/// Number of timed launches per candidate
pub const SEARCH_ITERS_ENV: &str = "MLPFORGE_SEARCH_ITERS";
/// Number of untimed warm-up launches per candidate
pub const SEARCH_WARMUP_ENV: &str = "MLPFORGE_SEARCH_WARMUP";

/// Algorithm search configuration
#[derive(Debug, Clone, PartialEq)]
pub struct KernelTuning {
    /// Candidates in discovery order; ties go to the earlier one
    pub candidates: Vec<GemmAlgorithm>,
    /// Candidate id to use without timing
    pub forced_algorithm: Option<u32>,
    pub warmup_iterations: usize,
    pub timed_iterations: usize,
}

impl Default for KernelTuning {
    fn default() -> Self {
        KernelTuning {
            candidates: vec![
                GemmAlgorithm::new(0, 16, 16, false),
                GemmAlgorithm::new(1, 32, 32, false),
                GemmAlgorithm::new(2, 64, 16, false),
                GemmAlgorithm::new(3, 16, 16, true),
                GemmAlgorithm::new(4, 32, 64, true),
                GemmAlgorithm::new(5, 64, 64, true),
            ],
            forced_algorithm: None,
            warmup_iterations: 1,
            timed_iterations: 3,
        }
    }
}

impl KernelTuning {
    /// Defaults with environment overrides applied
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = KernelTuning::default();

        if let Ok(algo) = env::var(GEMM_ALGO_ENV) {
            match algo.trim().parse::<u32>() {
                Ok(id) => config.forced_algorithm = Some(id),
                Err(_) => tracing::warn!("Ignoring {}={:?}: not an algorithm id", GEMM_ALGO_ENV, algo),
            }
        }

        if let Ok(iters) = env::var(SEARCH_ITERS_ENV) {
            if let Ok(n) = iters.trim().parse::<usize>() {
                config.timed_iterations = n;
            }
        }

        if let Ok(warmup) = env::var(SEARCH_WARMUP_ENV) {
            if let Ok(n) = warmup.trim().parse::<usize>() {
                config.warmup_iterations = n;
            }
        }

        config
    }

    /// Create tuning configuration with custom overrides
    pub fn with_override(&self, f: impl FnOnce(&mut KernelTuning)) -> Self {
        let mut config = self.clone();
        f(&mut config);
        config
    }

    pub fn candidate(&self, id: u32) -> Option<&GemmAlgorithm> {
        self.candidates.iter().find(|c| c.id == id)
    }

    /// The forced candidate, if it names one that exists
    pub fn forced_candidate(&self) -> Option<&GemmAlgorithm> {
        self.forced_algorithm.and_then(|id| self.candidate(id))
    }

    pub fn validate(&self) -> MlpResult<()> {
        if self.candidates.is_empty() {
            return Err(MlpForgeError::InvalidConfiguration(
                "at least one GEMM candidate is required".to_string(),
            ));
        }

        for (i, c) in self.candidates.iter().enumerate() {
            if c.tile_m == 0 || c.tile_n == 0 {
                return Err(MlpForgeError::InvalidConfiguration(format!(
                    "candidate {} has a zero tile size",
                    c.id
                )));
            }
            if self.candidates[..i].iter().any(|p| p.id == c.id) {
                return Err(MlpForgeError::InvalidConfiguration(format!(
                    "duplicate candidate id {}",
                    c.id
                )));
            }
        }

        if self.timed_iterations == 0 {
            return Err(MlpForgeError::InvalidConfiguration(
                "timed_iterations cannot be zero".to_string(),
            ));
        }

        Ok(())
    }
}
