//! Per-stage GEMM algorithm search
//!
//! Every candidate computes the same result, so the choice is purely a
//! timing decision and is made once per stage for the life of the engine.

use std::fmt;

use crate::backend::{DeviceStream, QueueId};
use crate::error::{MlpForgeError, MlpResult};
use crate::kernels::launch::{launch_gemm, GemmOperands};
use crate::kernels::{GemmAlgorithm, GemmDesc};
use crate::mlp::engine::MlpEngine;
use crate::mlp::stage::{Stage, StageAlgorithms};
use crate::profiling::KernelTimer;
use crate::tensor::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GemmRole {
    Fprop,
    Wgrad,
    Dgrad,
}

impl fmt::Display for GemmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GemmRole::Fprop => write!(f, "fprop"),
            GemmRole::Wgrad => write!(f, "wgrad"),
            GemmRole::Dgrad => write!(f, "dgrad"),
        }
    }
}

impl<T: Scalar> MlpEngine<T> {
    /// Pick the fastest algorithm for each GEMM of every stage not yet searched
    ///
    /// Trials run on the stage's own tensors and overwrite outputs and
    /// gradients. A candidate forced through `MLPFORGE_GEMM_ALGO` is used
    /// without timing. Ties keep the earlier candidate.
    pub fn search_algorithms(&mut self, stream: &DeviceStream) -> MlpResult<()> {
        self.ensure_bound()?;
        if stream.is_capturing()? {
            return Err(MlpForgeError::InvalidState(
                "algorithm search cannot run while the stream is capturing".to_string(),
            ));
        }

        let candidates: Vec<GemmAlgorithm> = self.provider.algorithms().to_vec();
        if candidates.is_empty() {
            return Err(MlpForgeError::InvalidConfiguration(format!(
                "provider {} offers no GEMM algorithms",
                self.provider.name()
            )));
        }

        let forced = match self.tuning.forced_algorithm {
            Some(id) => {
                let found = candidates.iter().copied().find(|c| c.id == id);
                if found.is_none() {
                    tracing::warn!(
                        "Forced GEMM algorithm {} is not offered by {}; searching instead",
                        id,
                        self.provider.name()
                    );
                }
                found
            }
            None => None,
        };

        for i in 0..self.stages.len() {
            if self.stages[i].algorithms.is_some() {
                continue;
            }
            let selected = match forced {
                Some(algo) => StageAlgorithms {
                    fprop: algo,
                    wgrad: algo,
                    dgrad: algo,
                },
                None => {
                    let stage = &self.stages[i];
                    StageAlgorithms {
                        fprop: self.fastest(stream, stage, GemmRole::Fprop, &candidates)?,
                        wgrad: self.fastest(stream, stage, GemmRole::Wgrad, &candidates)?,
                        dgrad: self.fastest(stream, stage, GemmRole::Dgrad, &candidates)?,
                    }
                }
            };
            tracing::debug!(
                "stage {} ({}): fprop {}, wgrad {}, dgrad {}",
                i,
                self.stages[i].kind,
                selected.fprop,
                selected.wgrad,
                selected.dgrad
            );
            self.stages[i].algorithms = Some(selected);
        }

        Ok(())
    }

    /// True once every stage has selected algorithms
    pub fn is_searched(&self) -> bool {
        self.stages.iter().all(|s| s.algorithms.is_some())
    }

    fn fastest(
        &self,
        stream: &DeviceStream,
        stage: &Stage<T>,
        role: GemmRole,
        candidates: &[GemmAlgorithm],
    ) -> MlpResult<GemmAlgorithm> {
        let timed = self.tuning.timed_iterations.max(1);
        let mut best: Option<(GemmAlgorithm, f32)> = None;

        for &algo in candidates {
            for _ in 0..self.tuning.warmup_iterations {
                self.trial(stream, stage, role, algo)?;
            }

            let mut timer = KernelTimer::for_kernel(format!("stage{}.{}:{}", stage.index, role, algo));
            timer.start(stream, QueueId::Primary)?;
            for _ in 0..timed {
                self.trial(stream, stage, role, algo)?;
            }
            timer.stop(stream)?;

            let ms = timer.elapsed().unwrap_or(f32::INFINITY) / timed as f32;
            tracing::trace!("{}: {:.4} ms", timer.name(), ms);
            if best.map_or(true, |(_, fastest)| ms < fastest) {
                best = Some((algo, ms));
            }
        }

        best.map(|(algo, _)| algo).ok_or_else(|| {
            MlpForgeError::InternalError("algorithm search ran no candidates".to_string())
        })
    }

    /// Enqueue one launch of `role` for `stage` with `algo`
    fn trial(
        &self,
        stream: &DeviceStream,
        stage: &Stage<T>,
        role: GemmRole,
        algo: GemmAlgorithm,
    ) -> MlpResult<()> {
        let batch = self.desc.batch_size;
        let math = self.desc.precision.math_mode();
        let dy = match &stage.act_grad {
            Some(act_grad) => act_grad,
            None => match self.stages.get(stage.index + 1) {
                Some(next) => &next.input_grad,
                None => self.output_grad(),
            },
        };

        let (desc, operands) = match role {
            GemmRole::Fprop => (
                GemmDesc::new(batch, stage.output_width, stage.input_width),
                GemmOperands {
                    a: &stage.input,
                    b: &stage.weight,
                    c: &stage.output,
                    bias_grad: None,
                },
            ),
            GemmRole::Wgrad => (
                GemmDesc::new(stage.input_width, stage.output_width, batch).with_trans_a(true),
                GemmOperands {
                    a: &stage.input,
                    b: dy,
                    c: &stage.weight_grad,
                    bias_grad: if stage.uses_fused_bias_grad() {
                        stage.bias_grad.as_ref()
                    } else {
                        None
                    },
                },
            ),
            GemmRole::Dgrad => (
                GemmDesc::new(batch, stage.input_width, stage.output_width).with_trans_b(true),
                GemmOperands {
                    a: dy,
                    b: &stage.weight,
                    c: &stage.input_grad,
                    bias_grad: None,
                },
            ),
        };

        let name = role.to_string();
        launch_gemm(
            stream,
            QueueId::Primary,
            &name,
            &self.provider,
            desc.with_math(math),
            algo,
            operands,
        )
    }
}
