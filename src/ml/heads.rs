// ============================================================
// Layer 5 — Task Heads
// ============================================================
// Small projections stacked on top of the shared body:
//
//   VocabHead       embeddings → vocabulary logits (lm and mlm).
//                   Tied: no weight of its own, projects through
//                   the body's token-embedding table (x · Wᵀ).
//                   Untied: its own bias-free Linear.
//
//   PredictionHead  pooled CLS embedding → task outputs.
//                   regression:     Linear → GELU → Linear
//                   classification: Linear, 2 outputs for a single
//                                   binary target, else one per target

use std::{fmt, str::FromStr};

use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::activation::gelu,
};
use serde::{Deserialize, Serialize};

use crate::ml::attention::normal_init;
use crate::ml::error::ModelError;

// ─── PredictionTaskType ───────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionTaskType {
    Classification,
    Regression,
}

impl FromStr for PredictionTaskType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(Self::Classification),
            "regression"     => Ok(Self::Regression),
            other => Err(ModelError::InvalidConfig {
                field:  "prediction_task_type",
                reason: format!("`{other}` is neither `classification` nor `regression`"),
            }),
        }
    }
}

impl fmt::Display for PredictionTaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classification => f.write_str("classification"),
            Self::Regression     => f.write_str("regression"),
        }
    }
}

// ─── PredictionHead ───────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct PredictionHead<B: Backend> {
    pub hidden: Option<Linear<B>>,
    pub out:    Linear<B>,
}

impl<B: Backend> PredictionHead<B> {
    /// Two-layer regression head.
    pub fn regression(
        embedding_dim: usize,
        hidden_dim:    usize,
        output_dim:    usize,
        device:        &B::Device,
    ) -> Self {
        Self {
            hidden: Some(
                LinearConfig::new(embedding_dim, hidden_dim)
                    .with_initializer(normal_init())
                    .init(device),
            ),
            out: LinearConfig::new(hidden_dim, output_dim)
                .with_initializer(normal_init())
                .init(device),
        }
    }

    /// Single-layer classification head.
    pub fn classification(embedding_dim: usize, output_dim: usize, device: &B::Device) -> Self {
        Self {
            hidden: None,
            out: LinearConfig::new(embedding_dim, output_dim)
                .with_initializer(normal_init())
                .init(device),
        }
    }

    /// Build the prediction head for a task type.
    pub fn for_task(
        task_type:     PredictionTaskType,
        embedding_dim: usize,
        hidden_dim:    usize,
        num_tasks:     usize,
        device:        &B::Device,
    ) -> Self {
        match task_type {
            PredictionTaskType::Regression => {
                Self::regression(embedding_dim, hidden_dim, num_tasks, device)
            }
            PredictionTaskType::Classification => {
                let classes = if num_tasks == 1 { 2 } else { num_tasks };
                Self::classification(embedding_dim, classes, device)
            }
        }
    }

    /// x: [batch, embed] → [batch, outputs]
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = match &self.hidden {
            Some(hidden) => gelu(hidden.forward(x)),
            None => x,
        };
        self.out.forward(x)
    }

    pub fn output_dim(&self) -> usize {
        self.out.weight.dims()[1]
    }
}

// ─── VocabHead ────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct VocabHead<B: Backend> {
    /// `None` when tied to the token-embedding table
    pub untied: Option<Linear<B>>,
}

impl<B: Backend> VocabHead<B> {
    pub fn tied() -> Self {
        Self { untied: None }
    }

    pub fn untied(embedding_dim: usize, vocab_size: usize, device: &B::Device) -> Self {
        Self {
            untied: Some(
                LinearConfig::new(embedding_dim, vocab_size)
                    .with_bias(false)
                    .with_initializer(normal_init())
                    .init(device),
            ),
        }
    }

    pub fn is_tied(&self) -> bool {
        self.untied.is_none()
    }

    /// x: [batch, seq, embed], token_embedding: [vocab, embed] → [batch, seq, vocab]
    pub fn forward(&self, x: Tensor<B, 3>, token_embedding: Tensor<B, 2>) -> Tensor<B, 3> {
        match &self.untied {
            Some(linear) => linear.forward(x),
            None => {
                let [batch, seq, embed] = x.dims();
                let [vocab, _] = token_embedding.dims();
                x.reshape([batch * seq, embed])
                    .matmul(token_embedding.transpose())
                    .reshape([batch, seq, vocab])
            }
        }
    }

    /// Projection weight in embedding layout [vocab, embed].
    pub fn weight(&self, token_embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        match &self.untied {
            // Linear stores [in, out]
            Some(linear) => linear.weight.val().transpose(),
            None => token_embedding,
        }
    }
}
