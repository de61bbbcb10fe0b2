// ============================================================
// Layer 5 — Sampling and Generation
// ============================================================
// Autoregressive SMILES generation from the causal LM head.
//
// Per step, for every row of the running context:
//
//   1. crop the context to the last `max_seq_len` tokens
//   2. one forward with `next_token_only` → logits [B, 1, V]
//   3. divide by temperature, keep the top-k logits (ties kept,
//      everything else −inf), softmax
//   4. sample one token; rows that already ended (last token is
//      the end token or padding) get padding instead
//   5. append
//
// The context lives on the host as token ids and is re-uploaded
// each step. There is no key/value cache.
//
// Generation runs on whatever backend the model lives on; callers
// that train pass the inner (non-autodiff) model, so no graph is
// recorded.

use burn::{prelude::*, tensor::TensorData};
use rand::{
    distributions::{Distribution, WeightedIndex},
    Rng,
};
use serde::{Deserialize, Serialize};

use crate::data::tokenizer::TaskTokenizer;
use crate::domain::task::Task;
use crate::ml::error::{ModelError, Result};
use crate::ml::model::Jointformer;

// ─── SamplingConfig ───────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Logits are divided by this before the softmax; must be > 0
    pub temperature: f64,
    /// Keep only the k most likely tokens (ties with the k-th kept)
    pub top_k: Option<usize>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { temperature: 1.0, top_k: None }
    }
}

impl SamplingConfig {
    pub fn new(temperature: f64, top_k: Option<usize>) -> Self {
        Self { temperature, top_k }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(ModelError::InvalidConfig {
                field:  "temperature",
                reason: format!("must be a positive number, got {}", self.temperature),
            });
        }
        if self.top_k == Some(0) {
            return Err(ModelError::InvalidConfig {
                field:  "top_k",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Draw one token id from a row of raw logits.
pub fn sample_next_token<R: Rng + ?Sized>(
    logits:   &[f32],
    sampling: &SamplingConfig,
    rng:      &mut R,
) -> Result<u32> {
    sampling.validate()?;
    if logits.is_empty() {
        return Err(ModelError::Sampling("empty logits row".into()));
    }

    let temperature = sampling.temperature as f32;
    let mut scaled: Vec<f32> = logits.iter().map(|l| l / temperature).collect();

    if let Some(k) = sampling.top_k {
        let k = k.min(scaled.len());
        let mut sorted = scaled.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let threshold = sorted[k - 1];
        for value in scaled.iter_mut() {
            if *value < threshold {
                *value = f32::NEG_INFINITY;
            }
        }
    }

    // Softmax weights; the max-shift keeps exp() in range
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = scaled.iter().map(|v| (v - max).exp()).collect();

    let dist = WeightedIndex::new(&weights)
        .map_err(|e| ModelError::Sampling(format!("cannot sample from logits: {e}")))?;
    Ok(dist.sample(rng) as u32)
}

/// Write `eos` into the last position of every sequence that has none.
pub fn force_end_token(sequences: &mut [Vec<u32>], eos: u32) {
    for sequence in sequences.iter_mut() {
        if !sequence.contains(&eos) {
            if let Some(last) = sequence.last_mut() {
                *last = eos;
            }
        }
    }
}

impl<B: Backend> Jointformer<B> {
    /// Extend every row of `context` by `max_new_tokens` sampled tokens.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_single_token<R: Rng + ?Sized>(
        &self,
        mut context:    Vec<Vec<u32>>,
        max_new_tokens: usize,
        sampling:       &SamplingConfig,
        eos_token_id:   u32,
        pad_token_id:   u32,
        device:         &B::Device,
        rng:            &mut R,
    ) -> Result<Vec<Vec<u32>>> {
        sampling.validate()?;
        let batch = context.len();
        if batch == 0 {
            return Ok(context);
        }
        let width = context[0].len();
        if width == 0 || context.iter().any(|row| row.len() != width) {
            return Err(ModelError::Sampling(
                "generation context rows must be non-empty and equally long".into(),
            ));
        }
        self.pooling().check_seq_len(width)?;

        let max_seq_len = self.max_seq_len();
        let mut ended = vec![false; batch];

        for step in 0..max_new_tokens {
            for (row, done) in context.iter().zip(ended.iter_mut()) {
                let last = row[row.len() - 1];
                *done |= last == eos_token_id || last == pad_token_id;
            }

            // ── Crop to the model window and upload ──────────────────────────
            let len = context[0].len();
            let start = len.saturating_sub(max_seq_len);
            let window = len - start;
            let flat: Vec<i64> = context
                .iter()
                .flat_map(|row| row[start..].iter().map(|&t| t as i64))
                .collect();
            let input_ids =
                Tensor::<B, 2, Int>::from_data(TensorData::new(flat, [batch, window]), device);

            // ── Next-token logits ─────────────────────────────────────────────
            let logits = self
                .forward(input_ids, Task::Generation, None, true)?
                .logits_generation
                .ok_or(ModelError::MissingLogits { task: "generation", head: "generation" })?;
            let vocab = logits.dims()[2];
            let logits = logits
                .reshape([batch, vocab])
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| ModelError::TensorData(format!("{e:?}")))?;

            // ── Sample, pad finished rows, append ─────────────────────────────
            for (r, row) in context.iter_mut().enumerate() {
                let next = if ended[r] {
                    pad_token_id
                } else {
                    sample_next_token(&logits[r * vocab..(r + 1) * vocab], sampling, rng)?
                };
                row.push(next);
            }

            if ended.iter().all(|&d| d) {
                tracing::trace!("All {} rows ended at step {}", batch, step);
            }
        }

        Ok(context)
    }

    /// `batch_size` samples continuing `prefix`, each guaranteed to contain `eos`.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_from_prefix<R: Rng + ?Sized>(
        &self,
        prefix:         &[u32],
        batch_size:     usize,
        max_new_tokens: usize,
        sampling:       &SamplingConfig,
        eos_token_id:   u32,
        pad_token_id:   u32,
        device:         &B::Device,
        rng:            &mut R,
    ) -> Result<Vec<Vec<u32>>> {
        let context = vec![prefix.to_vec(); batch_size];
        let mut sequences = self.generate_single_token(
            context,
            max_new_tokens,
            sampling,
            eos_token_id,
            pad_token_id,
            device,
            rng,
        )?;
        force_end_token(&mut sequences, eos_token_id);
        Ok(sequences)
    }

    /// Complete molecules starting from the tokenizer's generation prefix.
    pub fn generate<T, R>(
        &self,
        tokenizer:  &T,
        batch_size: usize,
        sampling:   &SamplingConfig,
        device:     &B::Device,
        rng:        &mut R,
    ) -> Result<Vec<Vec<u32>>>
    where
        T: TaskTokenizer + ?Sized,
        R: Rng + ?Sized,
    {
        let prefix = tokenizer.generation_prefix();
        self.generate_from_prefix(
            &prefix,
            batch_size,
            tokenizer.max_molecule_length().saturating_sub(2),
            sampling,
            tokenizer.sep_token_id(),
            tokenizer.pad_token_id(),
            device,
            rng,
        )
    }
}
