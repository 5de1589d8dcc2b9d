//! Network description
//!
//! ```rust,ignore
//! use mlpforge::mlp::{NetworkDesc, Precision};
//! use mlpforge::kernels::Activation;
//!
//! let desc = NetworkDesc::from_widths(4, &[16, 8, 4], Activation::Relu, true)
//!     .with_precision(Precision::Full);
//! desc.validate()?;
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{io_context, MlpForgeError, MlpResult};
use crate::kernels::{Activation, MathMode};
use crate::tensor::DType;

/// One fused linear stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDesc {
    pub input_width: usize,
    pub output_width: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub use_bias: bool,
    /// Compute the bias gradient inside the weight-gradient GEMM
    #[serde(default)]
    pub fuse_weight_and_bias: bool,
}

impl StageDesc {
    pub fn new(input_width: usize, output_width: usize) -> Self {
        StageDesc {
            input_width,
            output_width,
            activation: Activation::None,
            use_bias: false,
            fuse_weight_and_bias: false,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn with_fuse_weight_and_bias(mut self, fuse: bool) -> Self {
        self.fuse_weight_and_bias = fuse;
        self
    }
}

/// Numeric precision of storage and GEMM inputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// f32 storage and math
    #[default]
    Full,
    /// f16 storage, f32 accumulation
    ///
    /// No f32 master copy of the weights is kept; that belongs to the optimizer.
    Half,
    /// f32 storage, GEMM inputs rounded to tf32
    Tf32,
}

impl Precision {
    /// Element type the engine must be instantiated with
    pub fn dtype(self) -> DType {
        match self {
            Precision::Full | Precision::Tf32 => DType::F32,
            Precision::Half => DType::F16,
        }
    }

    pub fn math_mode(self) -> MathMode {
        match self {
            Precision::Tf32 => MathMode::Tf32,
            Precision::Full | Precision::Half => MathMode::Default,
        }
    }
}

/// How `initialize` fills weights; biases always start at zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    #[default]
    Zero,
    /// U(-l, l) with l = sqrt(6 / (in + out)), seeded per engine
    XavierUniform { seed: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDesc {
    pub stages: Vec<StageDesc>,
    pub batch_size: usize,
    #[serde(default)]
    pub precision: Precision,
    /// Run weight gradients on auxiliary queue 0
    #[serde(default)]
    pub overlap_wgrad: bool,
    /// Add into the gradient tensors instead of overwriting them
    #[serde(default)]
    pub accumulate_wgrad: bool,
    #[serde(default)]
    pub initializer: Initializer,
}

impl NetworkDesc {
    pub fn new(batch_size: usize) -> Self {
        NetworkDesc {
            stages: Vec::new(),
            batch_size,
            precision: Precision::default(),
            overlap_wgrad: false,
            accumulate_wgrad: false,
            initializer: Initializer::default(),
        }
    }

    /// Chain of stages through `widths`
    ///
    /// Every stage but the last uses `hidden_activation`; the last stage is
    /// linear. All stages share `use_bias`.
    pub fn from_widths(
        batch_size: usize,
        widths: &[usize],
        hidden_activation: Activation,
        use_bias: bool,
    ) -> Self {
        let mut desc = NetworkDesc::new(batch_size);
        let count = widths.len().saturating_sub(1);
        for (i, pair) in widths.windows(2).enumerate() {
            let activation = if i + 1 < count {
                hidden_activation
            } else {
                Activation::None
            };
            desc.stages.push(
                StageDesc::new(pair[0], pair[1])
                    .with_activation(activation)
                    .with_bias(use_bias),
            );
        }
        desc
    }

    pub fn with_stage(mut self, stage: StageDesc) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_overlap_wgrad(mut self, overlap: bool) -> Self {
        self.overlap_wgrad = overlap;
        self
    }

    pub fn with_accumulate_wgrad(mut self, accumulate: bool) -> Self {
        self.accumulate_wgrad = accumulate;
        self
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn input_width(&self) -> Option<usize> {
        self.stages.first().map(|s| s.input_width)
    }

    pub fn output_width(&self) -> Option<usize> {
        self.stages.last().map(|s| s.output_width)
    }

    /// Reject empty chains, zero sizes and width breaks
    pub fn validate(&self) -> MlpResult<()> {
        if self.batch_size == 0 {
            return Err(MlpForgeError::ShapeMismatch("batch size is zero".to_string()));
        }
        if self.stages.is_empty() {
            return Err(MlpForgeError::ShapeMismatch(
                "network has no stages".to_string(),
            ));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.input_width == 0 || stage.output_width == 0 {
                return Err(MlpForgeError::ShapeMismatch(format!(
                    "stage {} has zero width ({} -> {})",
                    i, stage.input_width, stage.output_width
                )));
            }
        }
        for (i, pair) in self.stages.windows(2).enumerate() {
            if pair[0].output_width != pair[1].input_width {
                return Err(MlpForgeError::ShapeMismatch(format!(
                    "stage {} outputs {} but stage {} expects {}",
                    i,
                    pair[0].output_width,
                    i + 1,
                    pair[1].input_width
                )));
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> MlpResult<Self> {
        let desc: NetworkDesc = serde_json::from_str(json)?;
        desc.validate()?;
        Ok(desc)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> MlpResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| io_context(e, &format!("reading {}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> MlpResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_widths() {
        let desc = NetworkDesc::from_widths(4, &[16, 8, 4], Activation::Relu, true);
        assert_eq!(desc.stages.len(), 2);
        assert_eq!(desc.stages[0].activation, Activation::Relu);
        assert_eq!(desc.stages[1].activation, Activation::None);
        assert!(desc.stages.iter().all(|s| s.use_bias));
        assert_eq!(desc.input_width(), Some(16));
        assert_eq!(desc.output_width(), Some(4));
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let empty = NetworkDesc::new(4);
        assert!(matches!(empty.validate(), Err(MlpForgeError::ShapeMismatch(_))));

        let zero_batch = NetworkDesc::from_widths(0, &[4, 4], Activation::None, false);
        assert!(zero_batch.validate().is_err());

        let zero_width = NetworkDesc::new(2).with_stage(StageDesc::new(4, 0));
        assert!(zero_width.validate().is_err());

        let broken = NetworkDesc::new(2)
            .with_stage(StageDesc::new(4, 8))
            .with_stage(StageDesc::new(6, 2));
        let err = broken.validate().unwrap_err();
        assert!(err.to_string().contains("stage 0 outputs 8"));
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_json_defaults() {
        let json = r#"{
            "batch_size": 8,
            "stages": [
                {"input_width": 3, "output_width": 5, "activation": "relu", "use_bias": true},
                {"input_width": 5, "output_width": 1}
            ]
        }"#;
        let desc = NetworkDesc::from_json_str(json).unwrap();
        assert_eq!(desc.precision, Precision::Full);
        assert_eq!(desc.initializer, Initializer::Zero);
        assert!(!desc.stages[1].use_bias);
        assert!(!desc.overlap_wgrad);
    }

    #[test]
    fn test_json_round_trip_with_initializer() {
        let desc = NetworkDesc::from_widths(2, &[4, 4], Activation::None, true)
            .with_precision(Precision::Half)
            .with_initializer(Initializer::XavierUniform { seed: 7 });
        let json = desc.to_json_string().unwrap();
        assert!(json.contains("xavier_uniform"));
        assert_eq!(NetworkDesc::from_json_str(&json).unwrap(), desc);
    }

    #[test]
    fn test_precision_mapping() {
        assert_eq!(Precision::Half.dtype(), DType::F16);
        assert_eq!(Precision::Tf32.dtype(), DType::F32);
        assert_eq!(Precision::Tf32.math_mode(), MathMode::Tf32);
        assert_eq!(Precision::Full.math_mode(), MathMode::Default);
    }
}
