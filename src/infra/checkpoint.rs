// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores everything a run needs to resume or to
// generate, using Burn's NamedMpkFileRecorder at full precision
// so a resumed run continues from exactly the saved weights.
//
//   <out_dir>/
//     model.mpk           model record
//     optimizer.mpk       AdamW moment estimates
//     ckpt.json           { iter_num, best_val_loss }
//     model_config.json   JointformerConfig (records tie_weights)
//     trainer_config.json the full run configuration
//     metrics.csv         eval log (MetricsLogger)
//     tokenizer.json      tokenizer (TokenizerStore)
//
// With tied weights the model record holds the embedding table
// once and the vocabulary heads hold nothing, so the tying
// survives the round trip by construction. The load path still
// checks that the saved config and the model being filled agree
// on tying, since a tied record cannot fill an untied model.
//
// Only the leader replica calls the save methods.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{bail, Context, Result};
use burn::{
    optim::Optimizer,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::ml::model::{Jointformer, JointformerConfig, JointformerOptimizer};

/// Loss assumed before the first evaluation.
pub const INITIAL_BEST_VAL_LOSS: f64 = 1e9;

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Iteration counter and best validation loss; mutated by the leader only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub iter_num:      usize,
    pub best_val_loss: f64,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self { iter_num: 0, best_val_loss: INITIAL_BEST_VAL_LOSS }
    }
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Creates the directory if it doesn't already exist.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    /// Open an existing checkpoint directory without creating anything.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            bail!("Checkpoint directory '{}' does not exist. Have you run 'train' first?", dir.display());
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Model ─────────────────────────────────────────────────────────────────
    pub fn save_model<B: Backend>(&self, model: &Jointformer<B>) -> Result<()> {
        let path = self.dir.join("model");
        CheckpointRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save model to '{}'", path.display()))?;
        Ok(())
    }

    /// Fill `model` with the saved weights. `model` must have been built
    /// from the saved model config.
    pub fn load_model<B: Backend>(
        &self,
        model:  Jointformer<B>,
        device: &B::Device,
    ) -> Result<Jointformer<B>> {
        let config = self.load_model_config()?;
        if config.tie_weights != model.is_tied() {
            bail!(
                "Checkpoint records tie_weights={} but the model has tie_weights={}",
                config.tie_weights,
                model.is_tied()
            );
        }

        let path = self.dir.join("model");
        let record = CheckpointRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Cannot load model from '{}'", path.display()))?;
        Ok(model.load_record(record))
    }

    // ── Optimizer ─────────────────────────────────────────────────────────────
    pub fn save_optimizer<B: AutodiffBackend>(&self, optimizer: &JointformerOptimizer<B>) -> Result<()> {
        let path = self.dir.join("optimizer");
        CheckpointRecorder::new()
            .record(optimizer.to_record(), path.clone())
            .with_context(|| format!("Failed to save optimizer to '{}'", path.display()))?;
        Ok(())
    }

    pub fn load_optimizer<B: AutodiffBackend>(
        &self,
        optimizer: JointformerOptimizer<B>,
        device:    &B::Device,
    ) -> Result<JointformerOptimizer<B>> {
        let path = self.dir.join("optimizer");
        let record = CheckpointRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Cannot load optimizer from '{}'", path.display()))?;
        Ok(optimizer.load_record(record))
    }

    // ── JSON files ────────────────────────────────────────────────────────────
    pub fn save_state(&self, state: &CheckpointState) -> Result<()> {
        self.write_json("ckpt.json", state)
    }

    pub fn load_state(&self) -> Result<CheckpointState> {
        self.read_json("ckpt.json")
    }

    pub fn save_model_config(&self, config: &JointformerConfig) -> Result<()> {
        self.write_json("model_config.json", config)
    }

    pub fn load_model_config(&self) -> Result<JointformerConfig> {
        self.read_json("model_config.json")
    }

    pub fn save_trainer_config<T: Serialize>(&self, config: &T) -> Result<()> {
        self.write_json("trainer_config.json", config)
    }

    /// Model, optimizer and state together.
    pub fn save_checkpoint<B: AutodiffBackend>(
        &self,
        model:     &Jointformer<B>,
        optimizer: &JointformerOptimizer<B>,
        state:     &CheckpointState,
    ) -> Result<()> {
        self.save_model(model)?;
        self.save_optimizer(optimizer)?;
        self.save_state(state)?;
        tracing::info!(
            "Saved checkpoint to '{}' (iter {}, best val loss {:.4})",
            self.dir.display(),
            state.iter_num,
            state.best_val_loss
        );
        Ok(())
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json).with_context(|| format!("Cannot write '{}'", path.display()))?;
        tracing::debug!("Wrote '{}'", path.display());
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        let json = fs::read_to_string(&path).with_context(|| {
            format!("Cannot read '{}'. Have you run 'train' first?", path.display())
        })?;
        serde_json::from_str(&json).with_context(|| format!("Invalid JSON in '{}'", path.display()))
    }
}
