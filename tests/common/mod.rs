//! Shared helpers for integration tests
//!
//! Provides a device/stream fixture, seeded data and a plain host reference
//! of the MLP forward and backward passes.

#![allow(dead_code)]

use anyhow::Context;
use mlpforge::mlp::Stage;
use mlpforge::{AllocatorKind, ArenaSet, Device, DeviceStream, MlpEngine, NetworkDesc, Scalar, TensorView};
use once_cell::sync::Lazy;
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

// Re-export serial_test for tests that touch process environment
pub use serial_test::serial;

/// One device shared by every test in a binary
pub static DEVICE: Lazy<Device> = Lazy::new(|| Device::open(0).expect("emulated device opens"));

/// Stream with one auxiliary queue on the shared device
pub fn stream() -> anyhow::Result<DeviceStream> {
    DeviceStream::with_aux_queues(&DEVICE, 1).context("failed to create stream")
}

/// Engine whose arenas are sealed and whose parameters are initialized
pub struct Harness<T: Scalar> {
    pub stream: DeviceStream,
    pub arenas: ArenaSet,
    pub engine: MlpEngine<T>,
}

impl<T: Scalar> Harness<T> {
    pub fn new(desc: NetworkDesc) -> anyhow::Result<Self> {
        let stream = stream()?;
        let mut arenas = ArenaSet::new(&DEVICE, AllocatorKind::DevicePrimary);
        let mut engine = MlpEngine::<T>::new(desc, &mut arenas).context("engine build")?;
        arenas.seal_all().context("seal")?;
        engine.initialize(&stream).context("initialize")?;
        Ok(Harness {
            stream,
            arenas,
            engine,
        })
    }

    /// Write the given parameters into every stage
    pub fn load_params(&self, params: &[RefStage]) -> anyhow::Result<()> {
        for (stage, reference) in self.engine.stages().iter().zip(params) {
            stage
                .weight()
                .upload(&self.stream, &to_scalar::<T>(&reference.weight))?;
            if let (Some(bias), Some(values)) = (stage.bias(), &reference.bias) {
                bias.upload(&self.stream, &to_scalar::<T>(values))?;
            }
        }
        Ok(())
    }

    /// Upload the input batch and the output gradient
    pub fn load_batch(&self, input: &[f32], output_grad: &[f32]) -> anyhow::Result<()> {
        self.engine
            .input()
            .upload(&self.stream, &to_scalar::<T>(input))?;
        self.engine
            .output_grad()
            .upload(&self.stream, &to_scalar::<T>(output_grad))?;
        Ok(())
    }

    /// Download one tensor of `stage` as f32
    pub fn download(
        &self,
        stage: usize,
        pick: fn(&Stage<T>) -> &TensorView<T>,
    ) -> anyhow::Result<Vec<f32>> {
        let stage = self
            .engine
            .stage(stage)
            .with_context(|| format!("no stage {}", stage))?;
        Ok(to_f32(&pick(stage).download(&self.stream)?))
    }

    pub fn bias_grad(&self, stage: usize) -> anyhow::Result<Vec<f32>> {
        let view = self
            .engine
            .stage(stage)
            .and_then(|s| s.bias_grad())
            .with_context(|| format!("stage {} has no bias gradient", stage))?;
        Ok(to_f32(&view.download(&self.stream)?))
    }

    /// Every gradient the engine produces, in a fixed order
    pub fn all_grads(&self) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut grads = Vec::new();
        for i in 0..self.engine.stage_count() {
            grads.push(self.download(i, |s| s.weight_grad())?);
            if self.engine.stages()[i].has_bias() {
                grads.push(self.bias_grad(i)?);
            }
        }
        grads.push(to_f32(&self.engine.input_grad().download(&self.stream)?));
        Ok(grads)
    }
}

pub fn to_scalar<T: Scalar>(values: &[f32]) -> Vec<T> {
    values.iter().map(|&v| T::from_f32(v)).collect()
}

pub fn to_f32<T: Scalar>(values: &[T]) -> Vec<f32> {
    values.iter().map(|v| v.to_f32()).collect()
}

/// Values drawn uniformly from `[-scale, scale]`
pub fn seeded_values(seed: u64, len: usize, scale: f32) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let dist = Uniform::new_inclusive(-scale, scale);
    (0..len).map(|_| dist.sample(&mut rng)).collect()
}

/// Round every value through the storage type `T`
pub fn quantize<T: Scalar>(values: &[f32]) -> Vec<f32> {
    to_f32(&to_scalar::<T>(values))
}

/// Host reference of one stage, parameters in f32
#[derive(Debug, Clone)]
pub struct RefStage {
    pub input_width: usize,
    pub output_width: usize,
    /// `[input_width x output_width]`, row-major
    pub weight: Vec<f32>,
    pub bias: Option<Vec<f32>>,
    pub relu: bool,
}

impl RefStage {
    pub fn seeded(seed: u64, input_width: usize, output_width: usize, bias: bool, relu: bool) -> Self {
        RefStage {
            input_width,
            output_width,
            weight: seeded_values(seed, input_width * output_width, 0.5),
            bias: bias.then(|| seeded_values(seed ^ 0xb1a5, output_width, 0.5)),
            relu,
        }
    }

    pub fn quantized<T: Scalar>(&self) -> Self {
        RefStage {
            weight: quantize::<T>(&self.weight),
            bias: self.bias.as_ref().map(|b| quantize::<T>(b)),
            ..self.clone()
        }
    }
}

/// Activations kept by the reference forward pass
#[derive(Debug, Clone)]
pub struct RefForward {
    /// Input of every stage
    pub inputs: Vec<Vec<f64>>,
    /// Pre-activation of every stage
    pub pre: Vec<Vec<f64>>,
    pub output: Vec<f64>,
}

/// Gradients of one stage
#[derive(Debug, Clone)]
pub struct RefGrads {
    pub weight: Vec<f64>,
    pub bias: Option<Vec<f64>>,
    pub input: Vec<f64>,
}

pub fn ref_forward(stages: &[RefStage], input: &[f32], batch: usize) -> RefForward {
    let mut x: Vec<f64> = input.iter().map(|&v| v as f64).collect();
    let mut inputs = Vec::new();
    let mut pre = Vec::new();
    for stage in stages {
        let mut z = vec![0.0f64; batch * stage.output_width];
        for r in 0..batch {
            for c in 0..stage.output_width {
                let mut acc = 0.0;
                for k in 0..stage.input_width {
                    acc += x[r * stage.input_width + k] * stage.weight[k * stage.output_width + c] as f64;
                }
                if let Some(bias) = &stage.bias {
                    acc += bias[c] as f64;
                }
                z[r * stage.output_width + c] = acc;
            }
        }
        let y = if stage.relu {
            z.iter().map(|&v| if v > 0.0 { v } else { 0.0 }).collect()
        } else {
            z.clone()
        };
        inputs.push(x);
        pre.push(z);
        x = y;
    }
    RefForward {
        inputs,
        pre,
        output: x,
    }
}

/// Analytic backward pass
///
/// `masks[i]` holds the pre-activation whose sign gates ReLU stage `i`. Pass
/// the reference's own pre-activations, or the engine's when the storage
/// precision may flip values that sit next to zero.
pub fn ref_backward(
    stages: &[RefStage],
    forward: &RefForward,
    masks: &[Vec<f64>],
    output_grad: &[f32],
    batch: usize,
) -> Vec<RefGrads> {
    let mut grad: Vec<f64> = output_grad.iter().map(|&v| v as f64).collect();
    let mut out = vec![None; stages.len()];
    for i in (0..stages.len()).rev() {
        let stage = &stages[i];
        let (n_in, n_out) = (stage.input_width, stage.output_width);
        let dy: Vec<f64> = if stage.relu {
            grad.iter()
                .zip(&masks[i])
                .map(|(&g, &z)| if z > 0.0 { g } else { 0.0 })
                .collect()
        } else {
            grad.clone()
        };

        let x = &forward.inputs[i];
        let mut dw = vec![0.0f64; n_in * n_out];
        for k in 0..n_in {
            for c in 0..n_out {
                dw[k * n_out + c] = (0..batch).map(|r| x[r * n_in + k] * dy[r * n_out + c]).sum();
            }
        }
        let db = stage.bias.as_ref().map(|_| {
            (0..n_out)
                .map(|c| (0..batch).map(|r| dy[r * n_out + c]).sum())
                .collect::<Vec<f64>>()
        });
        let mut dx = vec![0.0f64; batch * n_in];
        for r in 0..batch {
            for k in 0..n_in {
                dx[r * n_in + k] = (0..n_out)
                    .map(|c| dy[r * n_out + c] * stage.weight[k * n_out + c] as f64)
                    .sum();
            }
        }
        grad = dx.clone();
        out[i] = Some(RefGrads {
            weight: dw,
            bias: db,
            input: dx,
        });
    }
    out.into_iter().flatten().collect()
}

/// `|actual - expected| <= atol + rtol * |expected|` for every element
pub fn assert_close(actual: &[f32], expected: &[f64], rtol: f64, atol: f64, what: &str) {
    assert_eq!(actual.len(), expected.len(), "{}: length", what);
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let diff = (a as f64 - e).abs();
        assert!(
            diff <= atol + rtol * e.abs(),
            "{}[{}]: got {}, expected {} (diff {:.3e})",
            what,
            i,
            a,
            e,
            diff
        );
    }
}

/// Engine pre-activations as reference masks, one per stage
pub fn engine_masks<T: Scalar>(harness: &Harness<T>) -> anyhow::Result<Vec<Vec<f64>>> {
    (0..harness.engine.stage_count())
        .map(|i| {
            let values = harness.download(i, |s| s.inner())?;
            Ok(values.into_iter().map(f64::from).collect())
        })
        .collect()
}
