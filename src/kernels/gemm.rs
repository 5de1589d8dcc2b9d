//! General matrix multiply behind a vendor-style provider interface
//!
//! All matrices are row-major. With `trans_a` the A operand is stored as
//! `[k x m]`, with `trans_b` the B operand is stored as `[n x k]`; the logical
//! product is always `[m x k] * [k x n] -> [m x n]`.
//!
//! Tiling only partitions the output. The reduction over `k` always runs in
//! ascending order with the same arithmetic, so every algorithm of a provider
//! produces bit-identical results; algorithms differ in speed only.

use std::fmt;

use half::f16;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::backend::{DeviceError, DeviceResult};
use crate::kernels::tuning::KernelTuning;
use crate::tensor::Scalar;

/// Math mode for the multiply inputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathMode {
    /// Inputs used as stored
    #[default]
    Default,
    /// f32 inputs rounded to a 10-bit mantissa before multiplying
    Tf32,
}

/// Shape and scaling of one GEMM: `C = op(A) * op(B) + beta * C`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmDesc {
    pub trans_a: bool,
    pub trans_b: bool,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// 0 overwrites C without reading it
    pub beta: f32,
    pub math: MathMode,
}

impl GemmDesc {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        GemmDesc {
            trans_a: false,
            trans_b: false,
            m,
            n,
            k,
            beta: 0.0,
            math: MathMode::Default,
        }
    }

    pub fn with_trans_a(mut self, trans: bool) -> Self {
        self.trans_a = trans;
        self
    }

    pub fn with_trans_b(mut self, trans: bool) -> Self {
        self.trans_b = trans;
        self
    }

    pub fn with_beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_math(mut self, math: MathMode) -> Self {
        self.math = math;
        self
    }

    /// Check operand lengths against the shape
    pub fn validate(&self, a: usize, b: usize, c: usize, bias_grad: Option<usize>) -> DeviceResult<()> {
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return Err(DeviceError::execution(
                "gemm",
                format!("empty problem {}x{}x{}", self.m, self.n, self.k),
            ));
        }
        let expected = [
            ("A", a, self.m * self.k),
            ("B", b, self.k * self.n),
            ("C", c, self.m * self.n),
        ];
        for (operand, got, want) in expected {
            if got != want {
                return Err(DeviceError::execution(
                    "gemm",
                    format!("operand {} has {} elements, expected {}", operand, got, want),
                ));
            }
        }
        if let Some(len) = bias_grad {
            if len != self.n {
                return Err(DeviceError::execution(
                    "gemm",
                    format!("bias gradient has {} elements, expected {}", len, self.n),
                ));
            }
        }
        Ok(())
    }

    #[inline]
    fn a_index(&self, row: usize, p: usize) -> usize {
        if self.trans_a {
            p * self.m + row
        } else {
            row * self.k + p
        }
    }

    #[inline]
    fn b_index(&self, p: usize, col: usize) -> usize {
        if self.trans_b {
            col * self.k + p
        } else {
            p * self.n + col
        }
    }
}

/// One tile configuration of the GEMM kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmAlgorithm {
    pub id: u32,
    pub tile_m: usize,
    pub tile_n: usize,
    /// Row tiles are spread over the rayon pool
    pub parallel: bool,
}

impl GemmAlgorithm {
    pub const fn new(id: u32, tile_m: usize, tile_n: usize, parallel: bool) -> Self {
        GemmAlgorithm {
            id,
            tile_m,
            tile_n,
            parallel,
        }
    }
}

impl fmt::Display for GemmAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "algo{}({}x{}", self.id, self.tile_m, self.tile_n)?;
        if self.parallel {
            write!(f, ", parallel")?;
        }
        write!(f, ")")
    }
}

/// Math library interface used by every GEMM the engine launches
///
/// `bias_grad`, when given, receives the column sums of `op(B)` over `k`,
/// scaled with the same `beta` as C. This is the fused bias-gradient
/// reduction of the weight-gradient GEMM.
pub trait GemmProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Candidate algorithms in discovery order
    fn algorithms(&self) -> &[GemmAlgorithm];

    fn gemm_f32(
        &self,
        desc: &GemmDesc,
        algo: &GemmAlgorithm,
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        bias_grad: Option<&mut [f32]>,
    ) -> DeviceResult<()>;

    fn gemm_f16(
        &self,
        desc: &GemmDesc,
        algo: &GemmAlgorithm,
        a: &[f16],
        b: &[f16],
        c: &mut [f16],
        bias_grad: Option<&mut [f16]>,
    ) -> DeviceResult<()>;
}

/// Host implementation of [`GemmProvider`]
#[derive(Debug, Clone)]
pub struct HostBlas {
    candidates: Vec<GemmAlgorithm>,
}

impl Default for HostBlas {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBlas {
    pub fn new() -> Self {
        Self::with_tuning(&KernelTuning::default())
    }

    pub fn with_tuning(tuning: &KernelTuning) -> Self {
        HostBlas {
            candidates: tuning.candidates.clone(),
        }
    }
}

impl GemmProvider for HostBlas {
    fn name(&self) -> &str {
        "host-blas"
    }

    fn algorithms(&self) -> &[GemmAlgorithm] {
        &self.candidates
    }

    fn gemm_f32(
        &self,
        desc: &GemmDesc,
        algo: &GemmAlgorithm,
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        bias_grad: Option<&mut [f32]>,
    ) -> DeviceResult<()> {
        run(desc, algo, a, b, c, bias_grad)
    }

    fn gemm_f16(
        &self,
        desc: &GemmDesc,
        algo: &GemmAlgorithm,
        a: &[f16],
        b: &[f16],
        c: &mut [f16],
        bias_grad: Option<&mut [f16]>,
    ) -> DeviceResult<()> {
        run(desc, algo, a, b, c, bias_grad)
    }
}

/// Round an f32 to tf32 precision (round to nearest even on the dropped bits)
#[inline]
pub fn round_tf32(value: f32) -> f32 {
    if !value.is_finite() {
        return value;
    }
    let bits = value.to_bits();
    let rounded = (bits + 0x0FFF + ((bits >> 13) & 1)) & !0x1FFF;
    f32::from_bits(rounded)
}

fn run<T: Scalar>(
    desc: &GemmDesc,
    algo: &GemmAlgorithm,
    a: &[T],
    b: &[T],
    c: &mut [T],
    bias_grad: Option<&mut [T]>,
) -> DeviceResult<()> {
    desc.validate(a.len(), b.len(), c.len(), bias_grad.as_ref().map(|g| g.len()))?;
    if algo.tile_m == 0 || algo.tile_n == 0 {
        return Err(DeviceError::execution(
            "gemm",
            format!("{} has a zero tile size", algo),
        ));
    }

    let chunk = algo.tile_m * desc.n;
    if algo.parallel {
        c.par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(t, rows)| row_tile(desc, algo.tile_n, t * algo.tile_m, a, b, rows));
    } else {
        c.chunks_mut(chunk)
            .enumerate()
            .for_each(|(t, rows)| row_tile(desc, algo.tile_n, t * algo.tile_m, a, b, rows));
    }

    if let Some(dst) = bias_grad {
        for (col, out) in dst.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for p in 0..desc.k {
                acc += b[desc.b_index(p, col)].to_f32();
            }
            *out = scale_store(acc, desc.beta, *out);
        }
    }

    Ok(())
}

/// Compute `rows` (a run of complete output rows starting at `row0`)
fn row_tile<T: Scalar>(desc: &GemmDesc, tile_n: usize, row0: usize, a: &[T], b: &[T], rows: &mut [T]) {
    let n = desc.n;
    let tf32 = desc.math == MathMode::Tf32;
    let load = |v: T| {
        let x = v.to_f32();
        if tf32 {
            round_tf32(x)
        } else {
            x
        }
    };

    let row_count = rows.len() / n;
    let mut col0 = 0;
    while col0 < n {
        let col_end = (col0 + tile_n).min(n);
        for r in 0..row_count {
            let row = row0 + r;
            for col in col0..col_end {
                let mut acc = 0.0f32;
                for p in 0..desc.k {
                    acc += load(a[desc.a_index(row, p)]) * load(b[desc.b_index(p, col)]);
                }
                let out = &mut rows[r * n + col];
                *out = scale_store(acc, desc.beta, *out);
            }
        }
        col0 = col_end;
    }
}

#[inline]
pub(crate) fn scale_store<T: Scalar>(acc: f32, beta: f32, old: T) -> T {
    if beta == 0.0 {
        T::from_f32(acc)
    } else {
        T::from_f32(acc + beta * old.to_f32())
    }
}
