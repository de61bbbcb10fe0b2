// ============================================================
// Layer 5 — Hybrid Self-Attention
// ============================================================
// Multi-head self-attention that switches its masking pattern
// per call:
//
//   AttentionTask::Lm   → strictly causal, query i sees keys j <= i.
//                         Any key mask passed in is ignored.
//   AttentionTask::Mlm  → bidirectional. A key mask [batch, seq]
//                         (true = participates) blocks masked keys.
//
// Shapes through one call:
//
//   x          [B, T, E]
//   qkv        [B, T, 3E]          one fused projection
//   q, k, v    [B, H, T, E/H]
//   scores     [B, H, T, T]        explicit path only
//   y          [B, T, E]           heads concatenated, then projected
//
// Two numerically equivalent paths:
//
//   explicit  softmax(QKᵀ/√d) materialised and returned to the caller
//   fused     keys processed in tiles of `key_block_size` with an
//             online softmax (running max, running denominator,
//             running weighted sum), so no T×T matrix is ever built
//             and no weights are returned
//
// Reference: Vaswani et al. (2017) Attention Is All You Need
//            Dao et al. (2022) FlashAttention
//            Milakov & Gimelshein (2018) Online normalizer calculation

use burn::{
    nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig},
    prelude::*,
    tensor::{activation::softmax, TensorData},
};

use crate::domain::task::AttentionTask;
use crate::ml::error::{ModelError, Result as ModelResult};

/// Initialiser shared by every projection in the model.
pub(crate) const INIT_STD: f64 = 0.02;

pub(crate) fn normal_init() -> Initializer {
    Initializer::Normal { mean: 0.0, std: INIT_STD }
}

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct HybridSelfAttentionConfig {
    pub embed_dim: usize,
    pub num_heads: usize,
    #[config(default = true)]
    pub bias: bool,
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Use the tiled online-softmax path instead of the explicit one
    #[config(default = true)]
    pub fused: bool,
    #[config(default = 64)]
    pub key_block_size: usize,
}

impl HybridSelfAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ModelResult<HybridSelfAttention<B>> {
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(ModelError::HeadsDoNotDivide {
                embed_dim: self.embed_dim,
                num_heads: self.num_heads,
            });
        }
        if self.key_block_size == 0 {
            return Err(ModelError::InvalidConfig {
                field:  "key_block_size",
                reason: "must be at least 1".into(),
            });
        }

        let qkv = LinearConfig::new(self.embed_dim, 3 * self.embed_dim)
            .with_bias(self.bias)
            .with_initializer(normal_init())
            .init(device);
        let proj = LinearConfig::new(self.embed_dim, self.embed_dim)
            .with_bias(self.bias)
            .with_initializer(normal_init())
            .init(device);

        Ok(HybridSelfAttention {
            qkv,
            proj,
            attn_dropout:   DropoutConfig::new(self.dropout).init(),
            resid_dropout:  DropoutConfig::new(self.dropout).init(),
            num_heads:      self.num_heads,
            head_dim:       self.embed_dim / self.num_heads,
            fused:          self.fused,
            key_block_size: self.key_block_size,
        })
    }
}

#[derive(Module, Debug)]
pub struct HybridSelfAttention<B: Backend> {
    pub qkv:            Linear<B>,
    pub proj:           Linear<B>,
    pub attn_dropout:   Dropout,
    pub resid_dropout:  Dropout,
    pub num_heads:      usize,
    pub head_dim:       usize,
    pub fused:          bool,
    pub key_block_size: usize,
}

/// Attention result. `weights` is only populated by the explicit path.
#[derive(Debug, Clone)]
pub struct AttentionOutput<B: Backend> {
    pub output:  Tensor<B, 3>,
    pub weights: Option<Tensor<B, 4>>,
}

impl<B: Backend> HybridSelfAttention<B> {
    pub fn forward(
        &self,
        x:    Tensor<B, 3>,
        task: AttentionTask,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> AttentionOutput<B> {
        let [batch, seq, embed] = x.dims();
        let (heads, head_dim) = (self.num_heads, self.head_dim);

        // ── Fused QKV projection, split and move heads forward ───────────────
        let qkv = self.qkv.forward(x);
        let split = |from: usize| {
            qkv.clone()
                .slice([0..batch, 0..seq, from..from + embed])
                .reshape([batch, seq, heads, head_dim])
                .swap_dims(1, 2)
        };
        let (q, k, v) = (split(0), split(embed), split(2 * embed));

        // Lm ignores any external mask
        let key_mask = match task {
            AttentionTask::Lm  => None,
            AttentionTask::Mlm => mask,
        };

        let (y, weights) = if self.fused {
            (self.fused_attention(q, k, v, task, key_mask), None)
        } else {
            let (y, w) = self.explicit_attention(q, k, v, task, key_mask);
            (y, Some(w))
        };

        // ── Re-assemble heads side by side and project ────────────────────────
        let y = y.swap_dims(1, 2).reshape([batch, seq, embed]);
        let output = self.resid_dropout.forward(self.proj.forward(y));

        AttentionOutput { output, weights }
    }

    fn scale(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }

    /// softmax(QKᵀ/√d) V with the full weight matrix materialised.
    fn explicit_attention(
        &self,
        q:        Tensor<B, 4>,
        k:        Tensor<B, 4>,
        v:        Tensor<B, 4>,
        task:     AttentionTask,
        key_mask: Option<Tensor<B, 2, Bool>>,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let scores = q.matmul(k.swap_dims(2, 3)) * self.scale();
        let scores = apply_masks(scores, task, key_mask, 0);

        let weights = softmax(scores, 3);
        let y = self.attn_dropout.forward(weights.clone()).matmul(v);
        (y, weights)
    }

    /// Block-wise online softmax over key tiles.
    ///
    /// For each tile the running state per query row is updated as
    ///   m' = max(m, max_j s_j)
    ///   l' = l·e^(m−m') + Σ_j e^(s_j−m')
    ///   o' = o·e^(m−m') + Σ_j e^(s_j−m') v_j
    /// and the result is o / l once every tile has been seen.
    fn fused_attention(
        &self,
        q:        Tensor<B, 4>,
        k:        Tensor<B, 4>,
        v:        Tensor<B, 4>,
        task:     AttentionTask,
        key_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 4> {
        let [batch, heads, seq, head_dim] = q.dims();
        let device = q.device();
        let scale = self.scale();

        let mut running_max = Tensor::<B, 4>::full([batch, heads, seq, 1], f32::NEG_INFINITY, &device);
        let mut denom       = Tensor::<B, 4>::zeros([batch, heads, seq, 1], &device);
        let mut acc         = Tensor::<B, 4>::zeros([batch, heads, seq, head_dim], &device);

        let mut start = 0;
        while start < seq {
            let end = (start + self.key_block_size).min(seq);

            let k_tile = k.clone().slice([0..batch, 0..heads, start..end, 0..head_dim]);
            let v_tile = v.clone().slice([0..batch, 0..heads, start..end, 0..head_dim]);
            let tile_mask = key_mask
                .as_ref()
                .map(|m| m.clone().slice([0..batch, start..end]));

            let scores = q.clone().matmul(k_tile.swap_dims(2, 3)) * scale;
            let scores = apply_masks(scores, task, tile_mask, start);

            let new_max = running_max.clone().max_pair(scores.clone().max_dim(3));
            // A row that has only seen blocked keys keeps a -inf max; shift by 0 instead
            let safe_max = new_max
                .clone()
                .mask_fill(new_max.clone().equal_elem(f32::NEG_INFINITY), 0.0);

            let correction = (running_max - safe_max.clone()).exp();
            let probs = (scores - safe_max).exp();

            denom = denom * correction.clone() + probs.clone().sum_dim(3);
            acc = acc * correction + self.attn_dropout.forward(probs).matmul(v_tile);
            running_max = new_max;

            start = end;
        }

        acc / denom
    }
}

/// Fill blocked score entries with -inf.
///
/// `scores` is [B, H, Q, K] where the K keys start at absolute
/// position `key_offset`; `key_mask` covers exactly those K keys.
fn apply_masks<B: Backend>(
    scores:     Tensor<B, 4>,
    task:       AttentionTask,
    key_mask:   Option<Tensor<B, 2, Bool>>,
    key_offset: usize,
) -> Tensor<B, 4> {
    let [batch, heads, queries, keys] = scores.dims();
    let device = scores.device();

    match task {
        AttentionTask::Lm => {
            let blocked = causal_block_mask::<B>(queries, keys, key_offset, &device)
                .expand([batch, heads, queries, keys]);
            scores.mask_fill(blocked, f32::NEG_INFINITY)
        }
        AttentionTask::Mlm => match key_mask {
            Some(mask) => {
                let blocked = mask
                    .bool_not()
                    .reshape([batch, 1, 1, keys])
                    .expand([batch, heads, queries, keys]);
                scores.mask_fill(blocked, f32::NEG_INFINITY)
            }
            None => scores,
        },
    }
}

/// [1, 1, Q, K] mask, true where key (offset + j) lies in the future of query i.
fn causal_block_mask<B: Backend>(
    queries:    usize,
    keys:       usize,
    key_offset: usize,
    device:     &B::Device,
) -> Tensor<B, 4, Bool> {
    let blocked: Vec<bool> = (0..queries)
        .flat_map(|i| (0..keys).map(move |j| key_offset + j > i))
        .collect();
    Tensor::from_data(TensorData::new(blocked, [1, 1, queries, keys]), device)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn build(fused: bool, block: usize) -> HybridSelfAttention<TestBackend> {
        let device = Default::default();
        HybridSelfAttentionConfig::new(16, 4)
            .with_fused(fused)
            .with_key_block_size(block)
            .init(&device)
            .unwrap()
    }

    fn input(batch: usize, seq: usize) -> Tensor<TestBackend, 3> {
        let device = Default::default();
        Tensor::random([batch, seq, 16], Distribution::Normal(0.0, 1.0), &device)
    }

    fn values<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn key_mask(rows: Vec<Vec<bool>>) -> Tensor<TestBackend, 2, Bool> {
        let device = Default::default();
        let (b, t) = (rows.len(), rows[0].len());
        let flat: Vec<bool> = rows.into_iter().flatten().collect();
        Tensor::from_data(TensorData::new(flat, [b, t]), &device)
    }

    #[test]
    fn test_heads_must_divide_embedding() {
        let device: <TestBackend as Backend>::Device = Default::default();
        let err = HybridSelfAttentionConfig::new(10, 3)
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert_eq!(err, ModelError::HeadsDoNotDivide { embed_dim: 10, num_heads: 3 });
    }

    #[test]
    fn test_output_shape_matches_input() {
        let attn = build(true, 3);
        let out = attn.forward(input(2, 7), AttentionTask::Mlm, None);
        assert_eq!(out.output.dims(), [2, 7, 16]);
        // Fused path never returns weights
        assert!(out.weights.is_none());
    }

    #[test]
    fn test_lm_weights_are_zero_above_diagonal() {
        let attn = build(false, 64);
        let seq = 6;
        let out = attn.forward(input(2, seq), AttentionTask::Lm, None);
        let weights = out.weights.unwrap();
        assert_eq!(weights.dims(), [2, 4, seq, seq]);

        for (idx, w) in values(weights).iter().enumerate() {
            let j = idx % seq;
            let i = (idx / seq) % seq;
            if j > i {
                assert_eq!(*w, 0.0, "query {i} attends to future key {j}");
            }
        }
    }

    #[test]
    fn test_lm_ignores_key_mask() {
        let attn = build(false, 64);
        let x = input(1, 4);
        let mask = key_mask(vec![vec![true, false, true, false]]);
        let with_mask = values(attn.forward(x.clone(), AttentionTask::Lm, Some(mask)).output);
        let without   = values(attn.forward(x, AttentionTask::Lm, None).output);
        assert_eq!(with_mask, without);
    }

    #[test]
    fn test_mlm_masked_key_gets_zero_weight() {
        let attn = build(false, 64);
        let seq = 5;
        let mask = key_mask(vec![
            vec![true, true, false, true, true],
            vec![true, true, true, true, false],
        ]);
        let weights = attn
            .forward(input(2, seq), AttentionTask::Mlm, Some(mask))
            .weights
            .unwrap();
        let per_batch = 4 * seq * seq;
        for (idx, w) in values(weights).iter().enumerate() {
            let b = idx / per_batch;
            let j = idx % seq;
            let masked = (b == 0 && j == 2) || (b == 1 && j == 4);
            if masked {
                assert_eq!(*w, 0.0);
            } else {
                assert!(*w > 0.0);
            }
        }
    }

    #[test]
    fn test_fused_matches_explicit() {
        let explicit = build(false, 64);
        // Same weights, tiled path with a block that does not divide the sequence
        let mut fused = explicit.clone();
        fused.fused = true;
        fused.key_block_size = 3;

        let x = input(2, 8);
        let mask = key_mask(vec![
            vec![true, true, true, true, true, true, false, false],
            vec![true, true, true, true, true, true, true, true],
        ]);

        for (task, mask) in [
            (AttentionTask::Lm, None),
            (AttentionTask::Mlm, None),
            (AttentionTask::Mlm, Some(mask)),
        ] {
            let a = values(explicit.forward(x.clone(), task, mask.clone()).output);
            let b = values(fused.forward(x.clone(), task, mask).output);
            for (x, y) in a.iter().zip(b.iter()) {
                approx::assert_abs_diff_eq!(x, y, epsilon = 1e-5);
            }
        }
    }
}
