// ============================================================
// Layer 5 — Embedding Extraction Strategies
// ============================================================
// After the body runs, two views are cut from the token
// embeddings [B, T, E]:
//
//   CLS view  [B, E]     feeds the prediction / physchem heads
//   LM view   [B, P, E]  feeds the vocabulary head
//
// The strategy is chosen once at construction:
//
//   cls         CLS = position 0
//               LM  = all positions, or the last one only when
//                     next_token_only is set
//   prefix      as cls, but the LM view drops the leading prefix
//               token first (P = T − 1)
//   max_pooled  CLS = max over the sequence, padded positions
//               filled with −inf first; LM as cls

use std::{fmt, str::FromStr};

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::ml::error::{ModelError, Result};

/// Strategy seam for cutting the CLS and LM views out of the body output.
pub trait EmbeddingExtraction {
    /// embeddings: [B, T, E]; mask: [B, T], true = real token → [B, E]
    fn cls_embeddings<B: Backend>(
        &self,
        embeddings: Tensor<B, 3>,
        mask:       Option<&Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 2>;

    /// embeddings: [B, T, E] → [B, P, E]
    fn lm_embeddings<B: Backend>(&self, embeddings: Tensor<B, 3>, next_token_only: bool) -> Tensor<B, 3>;

    /// Shortest sequence this strategy can cut both views from.
    fn min_seq_len(&self) -> usize {
        1
    }
}

// ─── cls ──────────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, Default)]
pub struct ClsExtraction;

impl EmbeddingExtraction for ClsExtraction {
    fn cls_embeddings<B: Backend>(
        &self,
        embeddings: Tensor<B, 3>,
        _mask:      Option<&Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 2> {
        let [batch, _, embed] = embeddings.dims();
        embeddings.slice([0..batch, 0..1, 0..embed]).reshape([batch, embed])
    }

    fn lm_embeddings<B: Backend>(&self, embeddings: Tensor<B, 3>, next_token_only: bool) -> Tensor<B, 3> {
        if !next_token_only {
            return embeddings;
        }
        let [batch, seq, embed] = embeddings.dims();
        embeddings.slice([0..batch, seq - 1..seq, 0..embed])
    }
}

// ─── prefix ───────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixExtraction;

impl EmbeddingExtraction for PrefixExtraction {
    fn cls_embeddings<B: Backend>(
        &self,
        embeddings: Tensor<B, 3>,
        mask:       Option<&Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 2> {
        ClsExtraction.cls_embeddings(embeddings, mask)
    }

    fn lm_embeddings<B: Backend>(&self, embeddings: Tensor<B, 3>, next_token_only: bool) -> Tensor<B, 3> {
        let [batch, seq, embed] = embeddings.dims();
        let without_prefix = embeddings.slice([0..batch, 1..seq, 0..embed]);
        ClsExtraction.lm_embeddings(without_prefix, next_token_only)
    }

    fn min_seq_len(&self) -> usize {
        2
    }
}

// ─── max_pooled ───────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxPoolExtraction;

impl EmbeddingExtraction for MaxPoolExtraction {
    fn cls_embeddings<B: Backend>(
        &self,
        embeddings: Tensor<B, 3>,
        mask:       Option<&Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 2> {
        let [batch, seq, embed] = embeddings.dims();
        let embeddings = match mask {
            Some(mask) => {
                let padded = mask
                    .clone()
                    .bool_not()
                    .reshape([batch, seq, 1])
                    .expand([batch, seq, embed]);
                embeddings.mask_fill(padded, f32::NEG_INFINITY)
            }
            None => embeddings,
        };
        embeddings.max_dim(1).reshape([batch, embed])
    }

    fn lm_embeddings<B: Backend>(&self, embeddings: Tensor<B, 3>, next_token_only: bool) -> Tensor<B, 3> {
        ClsExtraction.lm_embeddings(embeddings, next_token_only)
    }
}

// ─── Pooling (config-facing selector) ─────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    #[default]
    Cls,
    Prefix,
    MaxPooled,
}

impl Pooling {
    pub fn as_str(self) -> &'static str {
        match self {
            Pooling::Cls       => "cls",
            Pooling::Prefix    => "prefix",
            Pooling::MaxPooled => "max_pooled",
        }
    }

    /// The LM view skips position 0, so generation needs a token after the task token.
    pub fn needs_start_token(self) -> bool {
        self.min_seq_len() > 1
    }

    /// Check the sequence is long enough to cut both views.
    pub fn check_seq_len(self, seq_len: usize) -> Result<()> {
        let min = self.min_seq_len();
        if seq_len < min {
            return Err(ModelError::SequenceTooShort {
                seq_len,
                min,
                strategy: self.as_str(),
            });
        }
        Ok(())
    }
}

impl EmbeddingExtraction for Pooling {
    fn cls_embeddings<B: Backend>(
        &self,
        embeddings: Tensor<B, 3>,
        mask:       Option<&Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 2> {
        match self {
            Pooling::Cls       => ClsExtraction.cls_embeddings(embeddings, mask),
            Pooling::Prefix    => PrefixExtraction.cls_embeddings(embeddings, mask),
            Pooling::MaxPooled => MaxPoolExtraction.cls_embeddings(embeddings, mask),
        }
    }

    fn lm_embeddings<B: Backend>(&self, embeddings: Tensor<B, 3>, next_token_only: bool) -> Tensor<B, 3> {
        match self {
            Pooling::Cls       => ClsExtraction.lm_embeddings(embeddings, next_token_only),
            Pooling::Prefix    => PrefixExtraction.lm_embeddings(embeddings, next_token_only),
            Pooling::MaxPooled => MaxPoolExtraction.lm_embeddings(embeddings, next_token_only),
        }
    }

    fn min_seq_len(&self) -> usize {
        match self {
            Pooling::Cls       => ClsExtraction.min_seq_len(),
            Pooling::Prefix    => PrefixExtraction.min_seq_len(),
            Pooling::MaxPooled => MaxPoolExtraction.min_seq_len(),
        }
    }
}

impl FromStr for Pooling {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cls"        => Ok(Pooling::Cls),
            "prefix"     => Ok(Pooling::Prefix),
            "max_pooled" => Ok(Pooling::MaxPooled),
            other => Err(ModelError::InvalidConfig {
                field:  "pooling",
                reason: format!("`{other}` is not one of cls, prefix, max_pooled"),
            }),
        }
    }
}

impl fmt::Display for Pooling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
