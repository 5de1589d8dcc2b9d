//! Element-wise epilogues fused around the GEMMs
//!
//! Activation boundary: a value passes only when it is strictly greater
//! than zero, in both directions.

use serde::{Deserialize, Serialize};

use crate::backend::{DeviceError, DeviceResult};
use crate::kernels::gemm::scale_store;
use crate::tensor::Scalar;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    None,
    Relu,
}

impl Activation {
    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Relu => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
        }
    }
}

/// Add the bias row to every row of `out`, keep the pre-activation in
/// `inner` and apply the activation in place
pub fn bias_activation_forward<T: Scalar>(
    out: &mut [T],
    bias: Option<&[T]>,
    mut inner: Option<&mut [T]>,
    cols: usize,
    activation: Activation,
) -> DeviceResult<()> {
    if cols == 0 || out.len() % cols != 0 {
        return Err(DeviceError::execution(
            "bias_activation",
            format!("{} elements do not form rows of {}", out.len(), cols),
        ));
    }
    if let Some(bias) = bias {
        if bias.len() != cols {
            return Err(DeviceError::execution(
                "bias_activation",
                format!("bias has {} elements, expected {}", bias.len(), cols),
            ));
        }
    }
    if let Some(inner) = inner.as_ref() {
        if inner.len() != out.len() {
            return Err(DeviceError::execution(
                "bias_activation",
                format!("inner has {} elements, expected {}", inner.len(), out.len()),
            ));
        }
    }

    for (i, value) in out.iter_mut().enumerate() {
        let mut t = value.to_f32();
        if let Some(bias) = bias {
            t += bias[i % cols].to_f32();
        }
        let stored = T::from_f32(t);
        if let Some(inner) = inner.as_deref_mut() {
            inner[i] = stored;
        }
        *value = T::from_f32(activation.apply(stored.to_f32()));
    }
    Ok(())
}

/// Gradient through the activation, gated by the stored pre-activation
pub fn activation_backward<T: Scalar>(
    grad_in: &[T],
    inner: &[T],
    act_grad: &mut [T],
    activation: Activation,
) -> DeviceResult<()> {
    if grad_in.len() != act_grad.len() || inner.len() != act_grad.len() {
        return Err(DeviceError::execution(
            "activation_backward",
            format!(
                "length mismatch: grad {}, inner {}, out {}",
                grad_in.len(),
                inner.len(),
                act_grad.len()
            ),
        ));
    }

    match activation {
        Activation::None => act_grad.copy_from_slice(grad_in),
        Activation::Relu => {
            for ((out, &g), &x) in act_grad.iter_mut().zip(grad_in).zip(inner) {
                *out = if x.to_f32() > 0.0 { g } else { T::default() };
            }
        }
    }
    Ok(())
}

/// `dst[j] = sum over rows of src[r][j] + beta * dst[j]`, rows in ascending order
pub fn column_sum<T: Scalar>(
    src: &[T],
    rows: usize,
    cols: usize,
    dst: &mut [T],
    beta: f32,
) -> DeviceResult<()> {
    if src.len() != rows * cols || dst.len() != cols {
        return Err(DeviceError::execution(
            "column_sum",
            format!(
                "{} elements as {}x{} into {} columns",
                src.len(),
                rows,
                cols,
                dst.len()
            ),
        ));
    }

    for (col, out) in dst.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for r in 0..rows {
            acc += src[r * cols + col].to_f32();
        }
        *out = scale_store(acc, beta, *out);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::gemm::{GemmDesc, GemmProvider, HostBlas};

    #[test]
    fn test_bias_relu_forward() {
        let mut out = vec![1.0f32, -2.0, 0.5, -0.5];
        let mut inner = vec![0.0f32; 4];
        bias_activation_forward(
            &mut out,
            Some(&[0.5f32, 1.0][..]),
            Some(&mut inner[..]),
            2,
            Activation::Relu,
        )
        .unwrap();
        assert_eq!(inner, vec![1.5, -1.0, 1.0, 0.5]);
        assert_eq!(out, vec![1.5, 0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_relu_zero_is_clamped() {
        let mut out = vec![-1.0f32, 0.0];
        bias_activation_forward(&mut out, Some(&[1.0f32, 0.0][..]), None, 2, Activation::Relu).unwrap();
        assert_eq!(out, vec![0.0, 0.0]);

        let mut grad = vec![9.0f32; 2];
        activation_backward(&[1.0, 1.0], &[0.0, 1e-6], &mut grad, Activation::Relu).unwrap();
        assert_eq!(grad, vec![0.0, 1.0]);
    }

    #[test]
    fn test_identity_backward_copies() {
        let mut grad = vec![0.0f32; 3];
        activation_backward(&[1.0, -2.0, 3.0], &[-1.0, -1.0, -1.0], &mut grad, Activation::None)
            .unwrap();
        assert_eq!(grad, vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_bias_length_checked() {
        let mut out = vec![0.0f32; 4];
        assert!(bias_activation_forward(&mut out, Some(&[1.0f32; 3][..]), None, 2, Activation::None).is_err());
        assert!(bias_activation_forward(&mut out, None, None, 3, Activation::None).is_err());
    }

    #[test]
    fn test_column_sum_beta() {
        let src = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut dst = vec![10.0f32, 20.0];
        column_sum(&src, 3, 2, &mut dst, 0.0).unwrap();
        assert_eq!(dst, vec![9.0, 12.0]);
        column_sum(&src, 3, 2, &mut dst, 1.0).unwrap();
        assert_eq!(dst, vec![18.0, 24.0]);
    }

    #[test]
    fn test_column_sum_matches_fused_gemm_reduction() {
        let (batch, inp, out) = (9, 4, 6);
        let x: Vec<f32> = (0..batch * inp).map(|i| (i as f32 * 0.37).sin()).collect();
        let g: Vec<f32> = (0..batch * out).map(|i| (i as f32 * 0.91).cos()).collect();

        let blas = HostBlas::new();
        let desc = GemmDesc::new(inp, out, batch).with_trans_a(true).with_beta(1.0);
        let mut dw = vec![0.0f32; inp * out];
        let mut fused = vec![0.25f32; out];
        blas.gemm_f32(&desc, &blas.algorithms()[1], &x, &g, &mut dw, Some(&mut fused[..]))
            .unwrap();

        let mut separate = vec![0.25f32; out];
        column_sum(&g, batch, out, &mut separate, 1.0).unwrap();
        assert_eq!(fused, separate);
    }
}
