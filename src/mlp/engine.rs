//! Fused MLP engine: forward, backward and parameter initialization

use std::sync::Arc;

use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::backend::{DeviceEvent, DeviceStream, QueueId};
use crate::error::{MlpForgeError, MlpResult};
use crate::kernels::launch::{
    launch_activation_backward, launch_bias_activation, launch_column_sum, launch_gemm,
    GemmOperands,
};
use crate::kernels::{Activation, GemmDesc, GemmProvider, HostBlas, KernelTuning, MathMode};
use crate::memory::{ArenaSet, TensorCategory};
use crate::mlp::config::{Initializer, NetworkDesc};
use crate::mlp::replay::CapturedStep;
use crate::mlp::stage::{Stage, StageAlgorithms};
use crate::tensor::{Scalar, TensorView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Tensors reserved, arenas may still be open
    Described,
    Initialized,
}

/// Chain of fused linear stages over arena-backed tensors
///
/// Construction reserves every tensor; the caller then seals the
/// [`ArenaSet`] and calls [`MlpEngine::initialize`]. Every pass only
/// enqueues work; results are visible after [`DeviceStream::synchronize`]
/// or a download.
#[derive(Debug)]
pub struct MlpEngine<T: Scalar> {
    pub(crate) desc: NetworkDesc,
    pub(crate) stages: Vec<Stage<T>>,
    input: TensorView<T>,
    output_grad: TensorView<T>,
    pub(crate) provider: Arc<dyn GemmProvider>,
    pub(crate) tuning: KernelTuning,
    math: MathMode,
    lifecycle: Lifecycle,
    /// Set by a training forward, consumed by backward
    pending_backward: bool,
    grad_ready: Vec<DeviceEvent>,
    wgrad_done: DeviceEvent,
    pub(crate) captured: Option<CapturedStep>,
}

impl<T: Scalar> MlpEngine<T> {
    /// Reserve the network input and every stage tensor, using the host GEMM
    /// provider and tuning from the environment
    pub fn new(desc: NetworkDesc, arenas: &mut ArenaSet) -> MlpResult<Self> {
        let tuning = KernelTuning::from_env();
        let provider: Arc<dyn GemmProvider> = Arc::new(HostBlas::with_tuning(&tuning));
        Self::with_provider(desc, arenas, provider, tuning)
    }

    pub fn with_provider(
        desc: NetworkDesc,
        arenas: &mut ArenaSet,
        provider: Arc<dyn GemmProvider>,
        tuning: KernelTuning,
    ) -> MlpResult<Self> {
        Self::check_desc(&desc, &tuning)?;
        Self::reserve_all(arenas, |arenas| {
            let width = desc.stages[0].input_width;
            let input = arenas
                .arena_mut(TensorCategory::Activations)
                .reserve_tensor::<T>("network.input", &[desc.batch_size, width])?;
            Self::build(desc, arenas, input, provider, tuning)
        })
    }

    /// Bind the first stage to an externally owned input tensor
    ///
    /// `input` must be `[batch_size, input_width]`.
    pub fn with_input(
        desc: NetworkDesc,
        arenas: &mut ArenaSet,
        input: TensorView<T>,
    ) -> MlpResult<Self> {
        let tuning = KernelTuning::from_env();
        let provider: Arc<dyn GemmProvider> = Arc::new(HostBlas::with_tuning(&tuning));
        Self::check_desc(&desc, &tuning)?;
        let expected = [desc.batch_size, desc.stages[0].input_width];
        if input.shape() != &expected[..] {
            return Err(MlpForgeError::ShapeMismatch(format!(
                "network input is {:?}, expected {:?}",
                input.shape(),
                expected
            )));
        }
        Self::reserve_all(arenas, |arenas| Self::build(desc, arenas, input, provider, tuning))
    }

    /// Run `reserve`; on failure forget whatever it reserved so a later
    /// `seal_all` packs no orphan tensors
    fn reserve_all(
        arenas: &mut ArenaSet,
        reserve: impl FnOnce(&mut ArenaSet) -> MlpResult<Self>,
    ) -> MlpResult<Self> {
        let mark = arenas.mark()?;
        match reserve(arenas) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                arenas.rollback(mark)?;
                Err(e)
            }
        }
    }

    fn check_desc(desc: &NetworkDesc, tuning: &KernelTuning) -> MlpResult<()> {
        desc.validate()?;
        tuning.validate()?;
        if desc.precision.dtype() != T::DTYPE {
            return Err(MlpForgeError::InvalidConfiguration(format!(
                "{:?} precision stores {}, engine element type is {}",
                desc.precision,
                desc.precision.dtype(),
                T::DTYPE
            )));
        }
        Ok(())
    }

    fn build(
        desc: NetworkDesc,
        arenas: &mut ArenaSet,
        input: TensorView<T>,
        provider: Arc<dyn GemmProvider>,
        tuning: KernelTuning,
    ) -> MlpResult<Self> {
        let mut stages = Vec::with_capacity(desc.stages.len());
        let mut current = input.clone();
        for (i, stage_desc) in desc.stages.iter().enumerate() {
            let stage = Stage::reserve(i, stage_desc, desc.batch_size, current, arenas)?;
            current = stage.output.clone();
            stages.push(stage);
        }

        let out_width = desc.stages[desc.stages.len() - 1].output_width;
        let output_grad = arenas
            .arena_mut(TensorCategory::Activations)
            .reserve_tensor::<T>("network.output_grad", &[desc.batch_size, out_width])?;

        tracing::debug!(
            "MlpEngine: {} stages, batch {}, {:?} precision, provider {}",
            stages.len(),
            desc.batch_size,
            desc.precision,
            provider.name()
        );

        Ok(MlpEngine {
            math: desc.precision.math_mode(),
            grad_ready: stages.iter().map(|_| DeviceEvent::new()).collect(),
            wgrad_done: DeviceEvent::new(),
            desc,
            stages,
            input,
            output_grad,
            provider,
            tuning,
            lifecycle: Lifecycle::Described,
            pending_backward: false,
            captured: None,
        })
    }

    /// Search algorithms, fill parameters and zero gradients
    ///
    /// Requires sealed arenas. Blocks until the fills have run.
    pub fn initialize(&mut self, stream: &DeviceStream) -> MlpResult<()> {
        self.ensure_bound()?;
        self.search_algorithms(stream)?;

        let mut rng = match self.desc.initializer {
            Initializer::Zero => None,
            Initializer::XavierUniform { seed } => Some(ChaCha8Rng::seed_from_u64(seed)),
        };
        for stage in &self.stages {
            match rng.as_mut() {
                None => stage.weight.fill_zero(stream)?,
                Some(rng) => {
                    let limit = (6.0 / (stage.input_width + stage.output_width) as f32).sqrt();
                    let dist = Uniform::new_inclusive(-limit, limit);
                    let values: Vec<T> = (0..stage.weight.len())
                        .map(|_| T::from_f32(dist.sample(rng)))
                        .collect();
                    stage.weight.upload(stream, &values)?;
                }
            }
            if let Some(bias) = &stage.bias {
                bias.fill_zero(stream)?;
            }
        }
        self.zero_gradients(stream)?;
        stream.synchronize()?;

        self.lifecycle = Lifecycle::Initialized;
        self.pending_backward = false;
        tracing::debug!("MlpEngine initialized ({:?})", self.desc.initializer);
        Ok(())
    }

    /// Enqueue zero fills of every weight and bias gradient
    pub fn zero_gradients(&self, stream: &DeviceStream) -> MlpResult<()> {
        for stage in &self.stages {
            stage.weight_grad.fill_zero(stream)?;
            if let Some(bias_grad) = &stage.bias_grad {
                bias_grad.fill_zero(stream)?;
            }
        }
        Ok(())
    }

    /// `output = activation(input x weight + bias)` for every stage in order
    ///
    /// The pre-activation is kept in each stage's inner tensor only when
    /// `is_training` is set.
    pub fn forward(&mut self, stream: &DeviceStream, is_training: bool) -> MlpResult<()> {
        self.ensure_initialized()?;
        let batch = self.desc.batch_size;

        for stage in &self.stages {
            let algos = stage_algorithms(stage)?;
            let desc = GemmDesc::new(batch, stage.output_width, stage.input_width)
                .with_math(self.math);
            launch_gemm(
                stream,
                QueueId::Primary,
                "fprop",
                &self.provider,
                desc,
                algos.fprop,
                GemmOperands {
                    a: &stage.input,
                    b: &stage.weight,
                    c: &stage.output,
                    bias_grad: None,
                },
            )?;

            let inner = if is_training { Some(&stage.inner) } else { None };
            if stage.has_bias() || stage.activation() != Activation::None || inner.is_some() {
                launch_bias_activation(
                    stream,
                    QueueId::Primary,
                    &stage.output,
                    stage.bias.as_ref(),
                    inner,
                    stage.activation(),
                )?;
            }
        }

        self.pending_backward = is_training;
        Ok(())
    }

    /// Gradients of every stage in reverse order
    ///
    /// Reads the network output gradient, which the caller writes after the
    /// training forward. Must follow a training forward.
    pub fn backward(&mut self, stream: &DeviceStream) -> MlpResult<()> {
        self.ensure_initialized()?;
        if !self.pending_backward {
            return Err(MlpForgeError::BackwardWithoutForward);
        }
        let overlap = self.desc.overlap_wgrad;
        if overlap && !stream.has_queue(QueueId::Aux(0)) {
            return Err(MlpForgeError::InvalidConfiguration(
                "overlap_wgrad needs a stream with an auxiliary queue".to_string(),
            ));
        }
        let wgrad_queue = if overlap { QueueId::Aux(0) } else { QueueId::Primary };
        let beta = if self.desc.accumulate_wgrad { 1.0 } else { 0.0 };
        let batch = self.desc.batch_size;

        for i in (0..self.stages.len()).rev() {
            let stage = &self.stages[i];
            let algos = stage_algorithms(stage)?;
            let incoming = self.incoming_grad(i);

            let dy = match &stage.act_grad {
                Some(act_grad) => {
                    launch_activation_backward(
                        stream,
                        QueueId::Primary,
                        incoming,
                        &stage.inner,
                        act_grad,
                        stage.activation(),
                    )?;
                    act_grad
                }
                None => incoming,
            };

            if overlap {
                stream.record_event(&self.grad_ready[i], QueueId::Primary)?;
                stream.wait_event(&self.grad_ready[i], wgrad_queue)?;
            }

            // dW = input^T x dy, optionally with the fused bias reduction
            let fused_bias = if stage.uses_fused_bias_grad() {
                stage.bias_grad.as_ref()
            } else {
                None
            };
            let wgrad = GemmDesc::new(stage.input_width, stage.output_width, batch)
                .with_trans_a(true)
                .with_beta(beta)
                .with_math(self.math);
            launch_gemm(
                stream,
                wgrad_queue,
                "wgrad",
                &self.provider,
                wgrad,
                algos.wgrad,
                GemmOperands {
                    a: &stage.input,
                    b: dy,
                    c: &stage.weight_grad,
                    bias_grad: fused_bias,
                },
            )?;
            if fused_bias.is_none() {
                if let Some(bias_grad) = &stage.bias_grad {
                    launch_column_sum(stream, wgrad_queue, dy, bias_grad, beta)?;
                }
            }

            // dX = dy x weight^T
            let dgrad = GemmDesc::new(batch, stage.input_width, stage.output_width)
                .with_trans_b(true)
                .with_math(self.math);
            launch_gemm(
                stream,
                QueueId::Primary,
                "dgrad",
                &self.provider,
                dgrad,
                algos.dgrad,
                GemmOperands {
                    a: dy,
                    b: &stage.weight,
                    c: &stage.input_grad,
                    bias_grad: None,
                },
            )?;
        }

        if overlap {
            stream.record_event(&self.wgrad_done, wgrad_queue)?;
            stream.wait_event(&self.wgrad_done, QueueId::Primary)?;
        }

        self.pending_backward = false;
        Ok(())
    }

    /// Gradient flowing into stage `i` from above
    fn incoming_grad(&self, i: usize) -> &TensorView<T> {
        match self.stages.get(i + 1) {
            Some(next) => &next.input_grad,
            None => &self.output_grad,
        }
    }

    /// Fail unless every arena backing the engine is sealed
    pub(crate) fn ensure_bound(&self) -> MlpResult<()> {
        self.input.byte_offset()?;
        self.output_grad.byte_offset()?;
        if let Some(stage) = self.stages.first() {
            stage.weight.byte_offset()?;
            stage.weight_grad.byte_offset()?;
        }
        Ok(())
    }

    pub(crate) fn ensure_initialized(&self) -> MlpResult<()> {
        match self.lifecycle {
            Lifecycle::Initialized => self.ensure_bound(),
            Lifecycle::Described => Err(MlpForgeError::EngineNotInitialized),
        }
    }

    pub fn desc(&self) -> &NetworkDesc {
        &self.desc
    }

    pub fn batch_size(&self) -> usize {
        self.desc.batch_size
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle == Lifecycle::Initialized
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, index: usize) -> Option<&Stage<T>> {
        self.stages.get(index)
    }

    pub fn stages(&self) -> &[Stage<T>] {
        &self.stages
    }

    /// `[batch_size, input_width]`
    pub fn input(&self) -> &TensorView<T> {
        &self.input
    }

    /// Last stage output, `[batch_size, output_width]`
    pub fn output(&self) -> &TensorView<T> {
        &self.stages[self.stages.len() - 1].output
    }

    /// Gradient of the loss with respect to the output; written by the caller
    pub fn output_grad(&self) -> &TensorView<T> {
        &self.output_grad
    }

    /// Gradient with respect to the network input
    pub fn input_grad(&self) -> &TensorView<T> {
        &self.stages[0].input_grad
    }

    pub fn provider(&self) -> &Arc<dyn GemmProvider> {
        &self.provider
    }

    pub fn tuning(&self) -> &KernelTuning {
        &self.tuning
    }

    pub fn set_fuse_weight_and_bias(&mut self, stage: usize, fuse: bool) -> MlpResult<()> {
        let count = self.stages.len();
        let target = self.stages.get_mut(stage).ok_or_else(|| {
            MlpForgeError::InvalidConfiguration(format!(
                "stage {} out of range ({} stages)",
                stage, count
            ))
        })?;
        target.fuse_weight_and_bias = fuse;
        self.desc.stages[stage].fuse_weight_and_bias = fuse;
        self.invalidate_graph();
        Ok(())
    }

    pub fn set_overlap_wgrad(&mut self, overlap: bool) {
        self.desc.overlap_wgrad = overlap;
        self.invalidate_graph();
    }

    pub fn set_accumulate_wgrad(&mut self, accumulate: bool) {
        self.desc.accumulate_wgrad = accumulate;
        self.invalidate_graph();
    }

    /// Force the next `run_step` to capture again
    pub fn invalidate_graph(&mut self) {
        if let Some(step) = self.captured.as_mut() {
            if step.graph.is_valid() {
                tracing::debug!("MlpEngine: captured graph {} invalidated", step.graph.id());
            }
            step.graph.invalidate();
        }
    }
}

fn stage_algorithms<T: Scalar>(stage: &Stage<T>) -> MlpResult<StageAlgorithms> {
    stage.algorithms.ok_or_else(|| {
        MlpForgeError::InvalidState(format!("stage {} has no selected algorithms", stage.index))
    })
}
