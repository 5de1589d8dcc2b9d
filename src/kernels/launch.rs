//! Enqueue kernels on a stream
//!
//! Views are resolved to device pointers when the launch is enqueued, so a
//! launch against an open or released arena fails immediately rather than on
//! the queue. The op itself only touches the resolved pointers and can be
//! replayed from a captured graph.

use std::sync::Arc;

use crate::backend::{DeviceStream, QueueId};
use crate::error::{MlpForgeError, MlpResult};
use crate::kernels::fused::{self, Activation};
use crate::kernels::gemm::{GemmAlgorithm, GemmDesc, GemmProvider};
use crate::tensor::{Scalar, TensorView};

/// Operands of one GEMM launch
pub struct GemmOperands<'a, T> {
    pub a: &'a TensorView<T>,
    pub b: &'a TensorView<T>,
    pub c: &'a TensorView<T>,
    /// Fused bias-gradient reduction target
    pub bias_grad: Option<&'a TensorView<T>>,
}

/// Enqueue `C = op(A) * op(B) + beta * C` on `queue`
pub fn launch_gemm<T: Scalar>(
    stream: &DeviceStream,
    queue: QueueId,
    name: &str,
    provider: &Arc<dyn GemmProvider>,
    desc: GemmDesc,
    algo: GemmAlgorithm,
    operands: GemmOperands<'_, T>,
) -> MlpResult<()> {
    desc.validate(
        operands.a.len(),
        operands.b.len(),
        operands.c.len(),
        operands.bias_grad.map(|g| g.len()),
    )
    .map_err(|e| MlpForgeError::ShapeMismatch(format!("{}: {}", name, e)))?;

    let a = operands.a.device_ptr()?;
    let b = operands.b.device_ptr()?;
    let c = operands.c.device_ptr()?;
    let bias_grad = operands.bias_grad.map(|g| g.device_ptr()).transpose()?;
    let provider = Arc::clone(provider);

    stream.launch(queue, name, move || {
        // SAFETY: the stage wiring never passes the same tensor as an input
        // and an output of one launch, and queue order serializes writers.
        let (a, b, c) = unsafe { (a.as_slice(), b.as_slice(), c.as_mut_slice()) };
        let bias_grad = bias_grad.as_ref().map(|g| unsafe { g.as_mut_slice() });
        T::gemm(provider.as_ref(), &desc, &algo, a, b, c, bias_grad)
    })?;
    Ok(())
}

/// Enqueue the fused bias add, pre-activation store and activation
pub fn launch_bias_activation<T: Scalar>(
    stream: &DeviceStream,
    queue: QueueId,
    output: &TensorView<T>,
    bias: Option<&TensorView<T>>,
    inner: Option<&TensorView<T>>,
    activation: Activation,
) -> MlpResult<()> {
    let cols = output.cols();
    if let Some(bias) = bias {
        if bias.len() != cols {
            return Err(MlpForgeError::ShapeMismatch(format!(
                "bias of {} elements for output {:?}",
                bias.len(),
                output.shape()
            )));
        }
    }
    if let Some(inner) = inner {
        if inner.len() != output.len() {
            return Err(MlpForgeError::ShapeMismatch(format!(
                "inner {:?} for output {:?}",
                inner.shape(),
                output.shape()
            )));
        }
    }

    let out = output.device_ptr()?;
    let bias = bias.map(|b| b.device_ptr()).transpose()?;
    let inner = inner.map(|i| i.device_ptr()).transpose()?;

    stream.launch(queue, "bias_activation", move || {
        // SAFETY: out, bias and inner are distinct reservations.
        let out = unsafe { out.as_mut_slice() };
        let bias = bias.as_ref().map(|b| unsafe { b.as_slice() });
        let inner = inner.as_ref().map(|i| unsafe { i.as_mut_slice() });
        fused::bias_activation_forward(out, bias, inner, cols, activation)
    })?;
    Ok(())
}

/// Enqueue the activation gradient
pub fn launch_activation_backward<T: Scalar>(
    stream: &DeviceStream,
    queue: QueueId,
    grad: &TensorView<T>,
    inner: &TensorView<T>,
    act_grad: &TensorView<T>,
    activation: Activation,
) -> MlpResult<()> {
    if grad.len() != act_grad.len() || inner.len() != act_grad.len() {
        return Err(MlpForgeError::ShapeMismatch(format!(
            "activation backward over {:?}, {:?} into {:?}",
            grad.shape(),
            inner.shape(),
            act_grad.shape()
        )));
    }

    let grad = grad.device_ptr()?;
    let inner = inner.device_ptr()?;
    let act_grad = act_grad.device_ptr()?;

    stream.launch(queue, "activation_backward", move || {
        // SAFETY: act_grad is written only by this op.
        let (grad, inner, act_grad) =
            unsafe { (grad.as_slice(), inner.as_slice(), act_grad.as_mut_slice()) };
        fused::activation_backward(grad, inner, act_grad, activation)
    })?;
    Ok(())
}

/// Enqueue a batch column sum (the unfused bias gradient)
pub fn launch_column_sum<T: Scalar>(
    stream: &DeviceStream,
    queue: QueueId,
    src: &TensorView<T>,
    dst: &TensorView<T>,
    beta: f32,
) -> MlpResult<()> {
    let (rows, cols) = (src.rows(), src.cols());
    if dst.len() != cols {
        return Err(MlpForgeError::ShapeMismatch(format!(
            "column sum of {:?} into {:?}",
            src.shape(),
            dst.shape()
        )));
    }

    let src = src.device_ptr()?;
    let dst = dst.device_ptr()?;

    stream.launch(queue, "column_sum", move || {
        // SAFETY: dst is written only by this op.
        let (src, dst) = unsafe { (src.as_slice(), dst.as_mut_slice()) };
        fused::column_sum(src, rows, cols, dst, beta)
    })?;
    Ok(())
}
