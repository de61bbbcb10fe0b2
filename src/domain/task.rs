// ============================================================
// Layer 3 — Task Tags
// ============================================================
// Every forward pass and every loss call is tagged with the
// objective it serves. The tag decides two things:
//
//   1. the attention pattern (causal vs bidirectional)
//   2. which head(s) fire
//
// Three closed enums cover the three places a tag is read:
//
//   Task          — model-facing:  generation | mlm | prediction | physchem
//   LossTask      — loss-facing:   lm | mlm | prediction | physchem
//   AttentionTask — attention:     lm | mlm
//
// Strings only enter through FromStr / serde. An unknown
// string is an error that names the value; nothing defaults.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a task string is not one of the known tags.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} task `{value}`, expected one of: {expected}")]
pub struct TaskError {
    pub kind:     &'static str,
    pub value:    String,
    pub expected: &'static str,
}

// ─── Task ─────────────────────────────────────────────────────────────────────
/// Model-facing task tag passed to `Jointformer::forward`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    #[serde(rename = "generation")]
    Generation,
    #[serde(rename = "mlm")]
    MaskedLm,
    #[serde(rename = "prediction")]
    Prediction,
    #[serde(rename = "physchem")]
    Physchem,
}

impl Task {
    /// Causal masking is used for generation only.
    pub fn is_causal(self) -> bool {
        matches!(self, Task::Generation)
    }

    pub fn attention_task(self) -> AttentionTask {
        if self.is_causal() {
            AttentionTask::Lm
        } else {
            AttentionTask::Mlm
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Task::Generation => "generation",
            Task::MaskedLm   => "mlm",
            Task::Prediction => "prediction",
            Task::Physchem   => "physchem",
        }
    }
}

impl FromStr for Task {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation" => Ok(Task::Generation),
            "mlm"        => Ok(Task::MaskedLm),
            "prediction" => Ok(Task::Prediction),
            "physchem"   => Ok(Task::Physchem),
            other => Err(TaskError {
                kind:     "model",
                value:    other.to_string(),
                expected: "generation, mlm, prediction, physchem",
            }),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── LossTask ─────────────────────────────────────────────────────────────────
/// Loss-facing task tag. `generation` is accepted as a spelling of `lm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LossTask {
    #[serde(rename = "lm", alias = "generation")]
    Lm,
    #[serde(rename = "mlm")]
    Mlm,
    #[serde(rename = "prediction")]
    Prediction,
    #[serde(rename = "physchem")]
    Physchem,
}

impl LossTask {
    pub const ALL: [LossTask; 4] = [
        LossTask::Lm,
        LossTask::Mlm,
        LossTask::Prediction,
        LossTask::Physchem,
    ];

    /// The forward-pass task that backs this loss.
    pub fn model_task(self) -> Task {
        match self {
            LossTask::Lm         => Task::Generation,
            LossTask::Mlm        => Task::MaskedLm,
            LossTask::Prediction => Task::Prediction,
            LossTask::Physchem   => Task::Physchem,
        }
    }

    /// Token-level objectives carry labels, the rest carry property targets.
    pub fn uses_labels(self) -> bool {
        matches!(self, LossTask::Lm | LossTask::Mlm)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LossTask::Lm         => "lm",
            LossTask::Mlm        => "mlm",
            LossTask::Prediction => "prediction",
            LossTask::Physchem   => "physchem",
        }
    }
}

impl FromStr for LossTask {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lm" | "generation" => Ok(LossTask::Lm),
            "mlm"               => Ok(LossTask::Mlm),
            "prediction"        => Ok(LossTask::Prediction),
            "physchem"          => Ok(LossTask::Physchem),
            other => Err(TaskError {
                kind:     "loss",
                value:    other.to_string(),
                expected: "lm, generation, mlm, prediction, physchem",
            }),
        }
    }
}

impl fmt::Display for LossTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── AttentionTask ────────────────────────────────────────────────────────────
/// Masking mode understood by the attention layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionTask {
    /// Strictly causal: query i attends to keys j <= i only.
    Lm,
    /// Bidirectional, with an optional key padding mask.
    Mlm,
}

impl AttentionTask {
    pub fn from_causal(is_causal: bool) -> Self {
        if is_causal {
            AttentionTask::Lm
        } else {
            AttentionTask::Mlm
        }
    }
}

impl FromStr for AttentionTask {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lm"  => Ok(AttentionTask::Lm),
            "mlm" => Ok(AttentionTask::Mlm),
            other => Err(TaskError {
                kind:     "attention",
                value:    other.to_string(),
                expected: "lm, mlm",
            }),
        }
    }
}
