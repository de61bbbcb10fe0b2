// ============================================================
// Layer 2 — Run Configuration
// ============================================================
// A training run is described by one JSON file:
//
//   {
//     "data":    { "train_path": ..., "max_molecule_length": 128, ... },
//     "model":   { "embedding_dim": 256, "num_layers": 6, ... },
//     "trainer": { "learning_rate": 6e-4, "max_iters": 600000, ... }
//   }
//
// Every section and every field has a default, so a file only
// needs the values it changes. `jointformer init-config` writes
// the full default file as a starting point.
//
// Serialisable so the checkpoint directory keeps an exact copy
// of the run that produced it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path, str::FromStr};

use crate::domain::task::LossTask;
use crate::ml::heads::PredictionTaskType;
use crate::ml::model::{JointformerConfig, DEFAULT_NUM_PHYSCHEM_TASKS};
use crate::ml::pooling::Pooling;
use crate::ml::precision::Precision;
use crate::ml::schedule::{CosineWithWarmup, LrSchedule};

// ─── InitFrom / DdpBackend ────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitFrom {
    Scratch,
    Resume,
}

impl FromStr for InitFrom {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scratch" => Ok(InitFrom::Scratch),
            "resume"  => Ok(InitFrom::Resume),
            other => anyhow::bail!("unknown init_from `{other}`, expected scratch or resume"),
        }
    }
}

impl fmt::Display for InitFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitFrom::Scratch => "scratch",
            InitFrom::Resume  => "resume",
        })
    }
}

/// Collective used between replicas. Only in-process thread replicas ship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdpBackend {
    Local,
}

// ─── TrainerConfig ────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub out_dir:                     String,
    pub eval_interval:               usize,
    pub log_interval:                usize,
    pub eval_iters:                  usize,
    pub eval_only:                   bool,
    pub always_save_checkpoint:      bool,
    pub init_from:                   InitFrom,
    pub learning_rate:               f64,
    pub max_iters:                   usize,
    pub weight_decay:                f64,
    pub beta1:                       f64,
    pub beta2:                       f64,
    /// Global-norm clip; 0 disables clipping
    pub grad_clip:                   f64,
    pub decay_lr:                    bool,
    pub warmup_iters:                usize,
    pub lr_decay_iters:              usize,
    pub min_lr:                      f64,
    pub ddp_enabled:                 bool,
    pub ddp_backend:                 DdpBackend,
    pub ddp_world_size:              usize,
    /// Global count; divided by the world size per replica
    pub gradient_accumulation_steps: usize,
    pub batch_size:                  usize,
    pub device:                      String,
    pub dtype:                       Precision,
    pub compile:                     bool,
    /// Relative weight of each objective when sampling a micro-batch's task
    pub task_probabilities:          BTreeMap<LossTask, f64>,
    pub seed:                        u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            out_dir:                     "out".to_string(),
            eval_interval:               2000,
            log_interval:                1,
            eval_iters:                  200,
            eval_only:                   false,
            always_save_checkpoint:      true,
            init_from:                   InitFrom::Scratch,
            learning_rate:               6e-4,
            max_iters:                   600_000,
            weight_decay:                1e-1,
            beta1:                       0.9,
            beta2:                       0.95,
            grad_clip:                   1.0,
            decay_lr:                    true,
            warmup_iters:                2000,
            lr_decay_iters:              600_000,
            min_lr:                      6e-5,
            ddp_enabled:                 false,
            ddp_backend:                 DdpBackend::Local,
            ddp_world_size:              1,
            gradient_accumulation_steps: 1,
            batch_size:                  12,
            device:                      "cpu".to_string(),
            dtype:                       Precision::Float32,
            compile:                     false,
            task_probabilities:          BTreeMap::from([(LossTask::Lm, 1.0)]),
            seed:                        1337,
        }
    }
}

impl TrainerConfig {
    pub fn lr_schedule(&self) -> LrSchedule {
        if self.decay_lr {
            LrSchedule::Cosine(CosineWithWarmup::new(
                self.learning_rate,
                self.min_lr,
                self.warmup_iters,
                self.lr_decay_iters,
            ))
        } else {
            LrSchedule::Constant(self.learning_rate)
        }
    }

    /// Number of replicas this run starts.
    pub fn world_size(&self) -> usize {
        if self.ddp_enabled { self.ddp_world_size.max(1) } else { 1 }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("trainer.batch_size must be greater than 0");
        }
        if self.eval_interval == 0 || self.log_interval == 0 {
            anyhow::bail!("trainer.eval_interval and trainer.log_interval must be greater than 0");
        }
        if self.eval_iters == 0 {
            anyhow::bail!("trainer.eval_iters must be greater than 0");
        }
        if self.grad_clip < 0.0 {
            anyhow::bail!("trainer.grad_clip must not be negative");
        }
        if self.task_probabilities.values().any(|p| !p.is_finite() || *p < 0.0) {
            anyhow::bail!("trainer.task_probabilities must be non-negative numbers");
        }
        if !self.task_probabilities.values().any(|p| *p > 0.0) {
            anyhow::bail!("trainer.task_probabilities needs at least one positive weight");
        }
        Ok(())
    }
}

// ─── DataConfig ───────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// File or directory of SMILES files
    pub train_path:          String,
    /// Separate validation source; split from the training data when absent
    pub val_path:            Option<String>,
    pub train_fraction:      f64,
    /// Tokens per sequence, task token and [SEP] included
    pub max_molecule_length: usize,
    /// Cap on the tokenizer vocabulary, special tokens included
    pub max_vocab_size:      Option<usize>,
    pub mlm_probability:     f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_path:          "data/train.csv".to_string(),
            val_path:            None,
            train_fraction:      0.9,
            max_molecule_length: 128,
            max_vocab_size:      None,
            mlm_probability:     0.15,
        }
    }
}

// ─── ModelOptions ─────────────────────────────────────────────────────────────
/// Architecture options. Vocabulary size and sequence length come
/// from the tokenizer and the data section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub embedding_dim:           usize,
    pub embedding_hidden_dim:    usize,
    pub attention_dropout:       f64,
    pub feed_forward_dropout:    f64,
    pub num_layers:              usize,
    pub num_heads:               usize,
    pub bias:                    bool,
    pub layer_norm_eps:          f64,
    pub prediction_task_type:    PredictionTaskType,
    pub prediction_hidden_dim:   usize,
    pub num_prediction_tasks:    usize,
    pub num_physchem_tasks:      usize,
    pub tie_weights:             bool,
    pub flash_attention:         bool,
    pub pooling:                 Pooling,
    pub output_layer_embeddings: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            embedding_dim:           256,
            embedding_hidden_dim:    1024,
            attention_dropout:       0.1,
            feed_forward_dropout:    0.1,
            num_layers:              6,
            num_heads:               8,
            bias:                    true,
            layer_norm_eps:          1e-5,
            prediction_task_type:    PredictionTaskType::Regression,
            prediction_hidden_dim:   256,
            num_prediction_tasks:    1,
            num_physchem_tasks:      DEFAULT_NUM_PHYSCHEM_TASKS,
            tie_weights:             true,
            flash_attention:         true,
            pooling:                 Pooling::Cls,
            output_layer_embeddings: false,
        }
    }
}

impl ModelOptions {
    pub fn to_model_config(&self, vocab_size: usize, max_seq_len: usize) -> JointformerConfig {
        JointformerConfig::new(vocab_size, max_seq_len)
            .with_embedding_dim(self.embedding_dim)
            .with_embedding_hidden_dim(self.embedding_hidden_dim)
            .with_attention_dropout(self.attention_dropout)
            .with_feed_forward_dropout(self.feed_forward_dropout)
            .with_num_layers(self.num_layers)
            .with_num_heads(self.num_heads)
            .with_bias(self.bias)
            .with_layer_norm_eps(self.layer_norm_eps)
            .with_prediction_task_type(self.prediction_task_type)
            .with_prediction_hidden_dim(self.prediction_hidden_dim)
            .with_num_prediction_tasks(self.num_prediction_tasks)
            .with_num_physchem_tasks(self.num_physchem_tasks)
            .with_tie_weights(self.tie_weights)
            .with_flash_attention(self.flash_attention)
            .with_pooling(self.pooling)
            .with_output_layer_embeddings(self.output_layer_embeddings)
    }
}

// ─── RunConfig ────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub data:    DataConfig,
    pub model:   ModelOptions,
    pub trainer: TrainerConfig,
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read run config '{}'", path.display()))?;
        let config: RunConfig = serde_json::from_str(&json)
            .with_context(|| format!("Invalid run config '{}'", path.display()))?;
        config.trainer.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Cannot write run config to '{}'", path.display()))
    }
}
