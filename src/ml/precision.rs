// ============================================================
// Layer 5 — Mixed Precision
// ============================================================
// The requested dtype is resolved against the device once, at
// trainer construction:
//
//   device   requested   effective
//   ───────  ──────────  ──────────────────────────────
//   cpu      any         float32
//   gpu      float32     float32
//   gpu      bfloat16    float32  (no bf16 element on wgpu)
//   gpu      float16     float16  + dynamic loss scaling
//
// The loss scaler multiplies the loss before backward so small
// float16 gradients do not flush to zero, divides the gradients
// again before clipping, and skips the optimizer step when any
// gradient overflowed. The scale halves on overflow and doubles
// after `growth_interval` clean steps.

use std::{fmt, str::FromStr};

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::ml::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "bfloat16")]
    Bfloat16,
    #[serde(rename = "float16")]
    Float16,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Float32  => "float32",
            Precision::Bfloat16 => "bfloat16",
            Precision::Float16  => "float16",
        }
    }
}

impl FromStr for Precision {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32"  => Ok(Precision::Float32),
            "bfloat16" => Ok(Precision::Bfloat16),
            "float16"  => Ok(Precision::Float16),
            other => Err(ModelError::InvalidConfig {
                field:  "dtype",
                reason: format!("unknown dtype `{other}`, expected float32, bfloat16 or float16"),
            }),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse device class; only the distinction cpu / gpu matters for precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl FromStr for DeviceKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower == "cpu" {
            return Ok(DeviceKind::Cpu);
        }
        if ["cuda", "gpu", "wgpu", "vulkan", "metal"]
            .iter()
            .any(|prefix| lower.starts_with(prefix))
        {
            return Ok(DeviceKind::Gpu);
        }
        Err(ModelError::InvalidConfig {
            field:  "device",
            reason: format!("unknown device `{s}`, expected cpu or a gpu name (cuda, wgpu, ...)"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionContext {
    pub requested: Precision,
    pub effective: Precision,
    pub device:    DeviceKind,
}

impl PrecisionContext {
    pub fn resolve(requested: Precision, device: DeviceKind) -> Self {
        let effective = match (device, requested) {
            (DeviceKind::Cpu, Precision::Float32) => Precision::Float32,
            (DeviceKind::Cpu, other) => {
                tracing::warn!("dtype {} is not used on cpu, training in float32", other);
                Precision::Float32
            }
            (DeviceKind::Gpu, Precision::Bfloat16) => {
                tracing::warn!("bfloat16 is not available on this backend, training in float32");
                Precision::Float32
            }
            (DeviceKind::Gpu, precision) => precision,
        };
        Self { requested, effective, device }
    }

    pub fn is_half(&self) -> bool {
        self.effective == Precision::Float16
    }

    /// Loss scaling only pays off for float16.
    pub fn scaler(&self) -> LossScaler {
        LossScaler::new(self.is_half())
    }
}

// ─── LossScaler ───────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq)]
pub struct LossScaler {
    enabled:         bool,
    scale:           f64,
    growth_factor:   f64,
    backoff_factor:  f64,
    growth_interval: usize,
    min_scale:       f64,
    clean_steps:     usize,
}

impl LossScaler {
    pub const INITIAL_SCALE: f64 = 65536.0;

    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale:           Self::INITIAL_SCALE,
            growth_factor:   2.0,
            backoff_factor:  0.5,
            growth_interval: 2000,
            min_scale:       1.0,
            clean_steps:     0,
        }
    }

    pub fn with_growth_interval(mut self, interval: usize) -> Self {
        self.growth_interval = interval.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current multiplier; 1.0 when disabled.
    pub fn scale(&self) -> f64 {
        if self.enabled { self.scale } else { 1.0 }
    }

    pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Adapt the scale after a step. `found_inf` means the step was skipped.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale = (self.scale * self.backoff_factor).max(self.min_scale);
            self.clean_steps = 0;
            tracing::warn!("Gradient overflow, loss scale reduced to {}", self.scale);
        } else {
            self.clean_steps += 1;
            if self.clean_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.clean_steps = 0;
                tracing::debug!("Loss scale grown to {}", self.scale);
            }
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    #[test]
    fn test_precision_parsing() {
        assert_eq!("bfloat16".parse::<Precision>().unwrap(), Precision::Bfloat16);
        assert!("float64".parse::<Precision>().is_err());
        assert_eq!("cuda:1".parse::<DeviceKind>().unwrap(), DeviceKind::Gpu);
        assert_eq!("cpu".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert!("tpu".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_resolution_table() {
        let cpu = PrecisionContext::resolve(Precision::Float16, DeviceKind::Cpu);
        assert_eq!(cpu.effective, Precision::Float32);
        assert!(!cpu.scaler().is_enabled());

        let bf16 = PrecisionContext::resolve(Precision::Bfloat16, DeviceKind::Gpu);
        assert_eq!(bf16.effective, Precision::Float32);

        let half = PrecisionContext::resolve(Precision::Float16, DeviceKind::Gpu);
        assert!(half.is_half());
        assert!(half.scaler().is_enabled());
    }

    #[test]
    fn test_scaler_backoff_and_growth() {
        let mut scaler = LossScaler::new(true).with_growth_interval(3);
        scaler.update(true);
        assert_eq!(scaler.scale(), 32768.0);

        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 32768.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 65536.0);

        // An overflow resets the clean-step count
        scaler.update(false);
        scaler.update(true);
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 32768.0);
    }

    #[test]
    fn test_scale_never_drops_below_one() {
        let mut scaler = LossScaler::new(true);
        for _ in 0..40 {
            scaler.update(true);
        }
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_disabled_scaler_is_identity() {
        let mut scaler = LossScaler::new(false);
        scaler.update(true);
        assert_eq!(scaler.scale(), 1.0);

        let loss = Tensor::<NdArray, 1>::from_data(TensorData::new(vec![2.5f32], [1]), &Default::default());
        let out = scaler.scale_loss(loss).into_scalar().elem::<f32>();
        assert_eq!(out, 2.5);
    }
}
