// ============================================================
// Layer 5 — Transformer Body
// ============================================================
// Shared encoder/decoder body used by every task head.
//
//   token embedding + learned position embedding
//       │ dropout
//       ▼
//   N × pre-norm block
//       x = x + attn(ln_1(x), task, mask)
//       x = x + ffn(ln_2(x))          ffn = linear → GELU → linear → dropout
//       │
//       ▼
//   final LayerNorm → embeddings [B, T, E]
//
// The same weights run causally (generation) or bidirectionally
// (mlm / prediction / physchem); `is_causal` and the optional
// attention mask are forwarded unchanged to every block.
//
// Reference: Radford et al. (2019) GPT-2 (pre-norm residual blocks)

use burn::{
    nn::{
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::gelu,
};

use crate::domain::task::AttentionTask;
use crate::ml::attention::{normal_init, HybridSelfAttention, HybridSelfAttentionConfig};
use crate::ml::error::{ModelError, Result as ModelResult};

#[derive(Config, Debug)]
pub struct TransformerConfig {
    pub vocab_size:         usize,
    pub max_seq_len:        usize,
    pub embedding_dim:      usize,
    pub embedding_hidden_dim: usize,
    pub num_layers:         usize,
    pub num_heads:          usize,
    #[config(default = 0.1)]
    pub attention_dropout:  f64,
    #[config(default = 0.1)]
    pub feed_forward_dropout: f64,
    #[config(default = true)]
    pub bias:               bool,
    #[config(default = 1e-5)]
    pub layer_norm_eps:     f64,
    #[config(default = true)]
    pub flash_attention:    bool,
}

impl TransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ModelResult<Transformer<B>> {
        if self.vocab_size == 0 || self.max_seq_len == 0 || self.embedding_dim == 0 {
            return Err(ModelError::InvalidConfig {
                field:  "vocab_size / max_seq_len / embedding_dim",
                reason: "must all be positive".into(),
            });
        }

        let token_embedding = EmbeddingConfig::new(self.vocab_size, self.embedding_dim)
            .with_initializer(normal_init())
            .init(device);
        let position_embedding = EmbeddingConfig::new(self.max_seq_len, self.embedding_dim)
            .with_initializer(normal_init())
            .init(device);

        let layers = (0..self.num_layers)
            .map(|_| self.build_block(device))
            .collect::<ModelResult<Vec<_>>>()?;

        Ok(Transformer {
            token_embedding,
            position_embedding,
            dropout:     DropoutConfig::new(self.feed_forward_dropout).init(),
            layers,
            ln_f:        LayerNormConfig::new(self.embedding_dim)
                .with_epsilon(self.layer_norm_eps)
                .init(device),
            max_seq_len: self.max_seq_len,
        })
    }

    fn build_block<B: Backend>(&self, device: &B::Device) -> ModelResult<Block<B>> {
        let attention = HybridSelfAttentionConfig::new(self.embedding_dim, self.num_heads)
            .with_bias(self.bias)
            .with_dropout(self.attention_dropout)
            .with_fused(self.flash_attention)
            .init(device)?;

        let ln = || {
            LayerNormConfig::new(self.embedding_dim)
                .with_epsilon(self.layer_norm_eps)
                .init(device)
        };

        Ok(Block {
            ln_1: ln(),
            attention,
            ln_2: ln(),
            mlp:  FeedForward {
                fc:      LinearConfig::new(self.embedding_dim, self.embedding_hidden_dim)
                    .with_bias(self.bias)
                    .with_initializer(normal_init())
                    .init(device),
                proj:    LinearConfig::new(self.embedding_hidden_dim, self.embedding_dim)
                    .with_bias(self.bias)
                    .with_initializer(normal_init())
                    .init(device),
                dropout: DropoutConfig::new(self.feed_forward_dropout).init(),
            },
        })
    }
}

// ─── Feed-forward ─────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    pub fc:      Linear<B>,
    pub proj:    Linear<B>,
    pub dropout: Dropout,
}

impl<B: Backend> FeedForward<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.dropout.forward(self.proj.forward(gelu(self.fc.forward(x))))
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    pub ln_1:      LayerNorm<B>,
    pub attention: HybridSelfAttention<B>,
    pub ln_2:      LayerNorm<B>,
    pub mlp:       FeedForward<B>,
}

impl<B: Backend> Block<B> {
    pub fn forward(
        &self,
        x:    Tensor<B, 3>,
        task: AttentionTask,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let attn = self.attention.forward(self.ln_1.forward(x.clone()), task, mask).output;
        let x = x + attn;
        let ffn = self.mlp.forward(self.ln_2.forward(x.clone()));
        x + ffn
    }
}

// ─── Transformer ──────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct Transformer<B: Backend> {
    pub token_embedding:    Embedding<B>,
    pub position_embedding: Embedding<B>,
    pub dropout:            Dropout,
    pub layers:             Vec<Block<B>>,
    pub ln_f:               LayerNorm<B>,
    pub max_seq_len:        usize,
}

pub struct TransformerOutput<B: Backend> {
    /// Final-norm token embeddings [B, T, E]
    pub embeddings:       Tensor<B, 3>,
    /// Output of every block, before the final norm
    pub layer_embeddings: Option<Vec<Tensor<B, 3>>>,
}

impl<B: Backend> Transformer<B> {
    /// input_ids: [batch, seq_len]; mask: [batch, seq_len], true = real token
    pub fn forward(
        &self,
        input_ids:              Tensor<B, 2, Int>,
        is_causal:              bool,
        attention_mask:         Option<Tensor<B, 2, Bool>>,
        output_layer_embeddings: bool,
    ) -> ModelResult<TransformerOutput<B>> {
        let [batch_size, seq_len] = input_ids.dims();
        if seq_len > self.max_seq_len {
            return Err(ModelError::SequenceTooLong {
                seq_len,
                max_seq_len: self.max_seq_len,
            });
        }

        let tok_emb = self.token_embedding.forward(input_ids);
        let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &tok_emb.device())
            .unsqueeze::<2>()
            .expand([batch_size, seq_len]);
        let pos_emb = self.position_embedding.forward(positions);

        let task = AttentionTask::from_causal(is_causal);
        let mut x = self.dropout.forward(tok_emb + pos_emb);
        let mut layer_embeddings = output_layer_embeddings.then(Vec::new);

        for layer in &self.layers {
            x = layer.forward(x, task, attention_mask.clone());
            if let Some(collected) = layer_embeddings.as_mut() {
                collected.push(x.clone());
            }
        }

        Ok(TransformerOutput {
            embeddings: self.ln_f.forward(x),
            layer_embeddings,
        })
    }

    /// Token-embedding table [vocab, embed]; the single owner of the tied weights.
    pub fn token_embedding_weight(&self) -> Tensor<B, 2> {
        self.token_embedding.weight.val()
    }

    pub fn embedding_dim(&self) -> usize {
        self.token_embedding.weight.dims()[1]
    }

    pub fn vocab_size(&self) -> usize {
        self.token_embedding.weight.dims()[0]
    }
}
