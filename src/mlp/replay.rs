//! Capture-once, replay-many training steps

use crate::backend::{DeviceStream, ExecutionGraph};
use crate::error::MlpResult;
use crate::mlp::config::Precision;
use crate::mlp::engine::MlpEngine;
use crate::mlp::stage::{StageAlgorithms, StageKind};
use crate::tensor::Scalar;

/// Everything a captured step depends on
///
/// A graph is replayed only while the engine's current signature equals the
/// one it was captured with.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSignature {
    pub batch_size: usize,
    pub stages: Vec<StageSignature>,
    pub overlap_wgrad: bool,
    pub accumulate_wgrad: bool,
    pub precision: Precision,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageSignature {
    pub input_width: usize,
    pub output_width: usize,
    pub kind: StageKind,
    pub fuse_weight_and_bias: bool,
    pub algorithms: Option<StageAlgorithms>,
}

#[derive(Debug)]
pub(crate) struct CapturedStep {
    pub(crate) signature: StepSignature,
    pub(crate) graph: ExecutionGraph,
}

/// What `run_step` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Ran forward and backward directly and recorded them
    Captured,
    /// Launched the recorded graph
    Replayed,
}

impl<T: Scalar> MlpEngine<T> {
    pub fn step_signature(&self) -> StepSignature {
        StepSignature {
            batch_size: self.desc.batch_size,
            stages: self
                .stages
                .iter()
                .map(|s| StageSignature {
                    input_width: s.input_width,
                    output_width: s.output_width,
                    kind: s.kind,
                    fuse_weight_and_bias: s.fuse_weight_and_bias,
                    algorithms: s.algorithms,
                })
                .collect(),
            overlap_wgrad: self.desc.overlap_wgrad,
            accumulate_wgrad: self.desc.accumulate_wgrad,
            precision: self.desc.precision,
        }
    }

    /// One training step: forward (training) then backward
    ///
    /// The first call, and any call after the signature changed or the graph
    /// was invalidated, runs the step under capture. Other calls replay the
    /// captured graph. Either way the work is only enqueued.
    pub fn run_step(&mut self, stream: &DeviceStream) -> MlpResult<StepOutcome> {
        self.ensure_initialized()?;
        let signature = self.step_signature();

        if let Some(step) = &self.captured {
            if step.graph.is_valid() && step.signature == signature {
                stream.launch_graph(&step.graph)?;
                tracing::trace!("run_step: replayed graph {}", step.graph.id());
                return Ok(StepOutcome::Replayed);
            }
        }

        let ((), graph) = stream.capture(|s| -> MlpResult<()> {
            self.forward(s, true)?;
            self.backward(s)
        })?;
        tracing::debug!(
            "run_step: captured graph {} with {} ops on {} queues",
            graph.id(),
            graph.launch_count(),
            graph.queue_count()
        );
        self.captured = Some(CapturedStep { signature, graph });
        Ok(StepOutcome::Captured)
    }

    /// True if the next `run_step` may replay
    pub fn has_captured_graph(&self) -> bool {
        self.captured
            .as_ref()
            .map_or(false, |step| step.graph.is_valid())
    }

    pub fn captured_graph(&self) -> Option<&ExecutionGraph> {
        self.captured.as_ref().map(|step| &step.graph)
    }
}
