//! One fused linear stage and its tensors

use std::fmt;

use crate::error::MlpResult;
use crate::kernels::{Activation, GemmAlgorithm};
use crate::memory::{ArenaSet, TensorCategory};
use crate::mlp::config::StageDesc;
use crate::tensor::{Scalar, TensorView};

/// Closed set of stage variants, selected from the bias and activation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Linear,
    LinearBias,
    LinearRelu,
    LinearBiasRelu,
}

impl StageKind {
    pub fn of(desc: &StageDesc) -> Self {
        match (desc.use_bias, desc.activation) {
            (false, Activation::None) => StageKind::Linear,
            (true, Activation::None) => StageKind::LinearBias,
            (false, Activation::Relu) => StageKind::LinearRelu,
            (true, Activation::Relu) => StageKind::LinearBiasRelu,
        }
    }

    pub fn has_bias(self) -> bool {
        matches!(self, StageKind::LinearBias | StageKind::LinearBiasRelu)
    }

    pub fn activation(self) -> Activation {
        match self {
            StageKind::Linear | StageKind::LinearBias => Activation::None,
            StageKind::LinearRelu | StageKind::LinearBiasRelu => Activation::Relu,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Linear => "linear",
            StageKind::LinearBias => "linear+bias",
            StageKind::LinearRelu => "linear+relu",
            StageKind::LinearBiasRelu => "linear+bias+relu",
        };
        f.write_str(name)
    }
}

/// Algorithms picked for the three GEMMs of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageAlgorithms {
    pub fprop: GemmAlgorithm,
    pub wgrad: GemmAlgorithm,
    pub dgrad: GemmAlgorithm,
}

/// A stage of the engine
///
/// `input` is the previous stage's `output` (or the network input). The
/// incoming gradient is the next stage's `input_grad` (or the network
/// output gradient) and is wired by the engine.
#[derive(Debug)]
pub struct Stage<T: Scalar> {
    pub(crate) index: usize,
    pub(crate) kind: StageKind,
    pub(crate) input_width: usize,
    pub(crate) output_width: usize,
    pub(crate) fuse_weight_and_bias: bool,
    pub(crate) input: TensorView<T>,
    pub(crate) weight: TensorView<T>,
    pub(crate) bias: Option<TensorView<T>>,
    pub(crate) weight_grad: TensorView<T>,
    pub(crate) bias_grad: Option<TensorView<T>>,
    pub(crate) inner: TensorView<T>,
    pub(crate) output: TensorView<T>,
    /// Only ReLU stages need a separate gradient through the activation
    pub(crate) act_grad: Option<TensorView<T>>,
    pub(crate) input_grad: TensorView<T>,
    pub(crate) algorithms: Option<StageAlgorithms>,
}

impl<T: Scalar> Stage<T> {
    /// Reserve every tensor of the stage from its category arena
    pub(crate) fn reserve(
        index: usize,
        desc: &StageDesc,
        batch_size: usize,
        input: TensorView<T>,
        arenas: &mut ArenaSet,
    ) -> MlpResult<Self> {
        let kind = StageKind::of(desc);
        let (inp, out) = (desc.input_width, desc.output_width);
        let label = |name: &str| format!("stage{}.{}", index, name);

        let weights = arenas.arena_mut(TensorCategory::Weights);
        let weight = weights.reserve_tensor::<T>(label("weight"), &[inp, out])?;
        let bias = if kind.has_bias() {
            Some(weights.reserve_tensor::<T>(label("bias"), &[out])?)
        } else {
            None
        };

        let grads = arenas.arena_mut(TensorCategory::WeightGrads);
        let weight_grad = grads.reserve_tensor::<T>(label("weight_grad"), &[inp, out])?;
        let bias_grad = if kind.has_bias() {
            Some(grads.reserve_tensor::<T>(label("bias_grad"), &[out])?)
        } else {
            None
        };

        let activations = arenas.arena_mut(TensorCategory::Activations);
        let inner = activations.reserve_tensor::<T>(label("inner"), &[batch_size, out])?;
        let output = activations.reserve_tensor::<T>(label("output"), &[batch_size, out])?;
        let act_grad = if kind.activation() == Activation::Relu {
            Some(activations.reserve_tensor::<T>(label("act_grad"), &[batch_size, out])?)
        } else {
            None
        };
        let input_grad = activations.reserve_tensor::<T>(label("input_grad"), &[batch_size, inp])?;

        Ok(Stage {
            index,
            kind,
            input_width: inp,
            output_width: out,
            fuse_weight_and_bias: desc.fuse_weight_and_bias,
            input,
            weight,
            bias,
            weight_grad,
            bias_grad,
            inner,
            output,
            act_grad,
            input_grad,
            algorithms: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn activation(&self) -> Activation {
        self.kind.activation()
    }

    pub fn input_width(&self) -> usize {
        self.input_width
    }

    pub fn output_width(&self) -> usize {
        self.output_width
    }

    pub fn has_bias(&self) -> bool {
        self.kind.has_bias()
    }

    pub fn fuse_weight_and_bias(&self) -> bool {
        self.fuse_weight_and_bias
    }

    /// True when the bias gradient is computed inside the weight-gradient GEMM
    pub(crate) fn uses_fused_bias_grad(&self) -> bool {
        self.fuse_weight_and_bias && self.has_bias()
    }

    pub fn input(&self) -> &TensorView<T> {
        &self.input
    }

    /// `[input_width, output_width]`
    pub fn weight(&self) -> &TensorView<T> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&TensorView<T>> {
        self.bias.as_ref()
    }

    pub fn weight_grad(&self) -> &TensorView<T> {
        &self.weight_grad
    }

    pub fn bias_grad(&self) -> Option<&TensorView<T>> {
        self.bias_grad.as_ref()
    }

    /// Pre-activation of the latest training forward
    pub fn inner(&self) -> &TensorView<T> {
        &self.inner
    }

    pub fn output(&self) -> &TensorView<T> {
        &self.output
    }

    pub fn input_grad(&self) -> &TensorView<T> {
        &self.input_grad
    }

    /// `None` until the engine has searched algorithms
    pub fn algorithms(&self) -> Option<&StageAlgorithms> {
        self.algorithms.as_ref()
    }
}
