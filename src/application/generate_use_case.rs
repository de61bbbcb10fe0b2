// ============================================================
// Layer 2 — GenerateUseCase
// ============================================================
// Loads a trained checkpoint and samples new molecules:
//
//   Step 1: Read model_config.json and tokenizer.json
//   Step 2: Rebuild the model and load model.mpk
//   Step 3: Sample in batches from the [GENERATE] prefix
//   Step 4: Decode, score validity, collect unique canonical SMILES
//
// Generation needs no gradients, so the model runs on the plain
// backend: NdArray for "cpu", Wgpu otherwise.

use anyhow::{bail, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, NdArray, Wgpu},
    prelude::*,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::data::tokenizer::{SmilesTokenizer, TaskTokenizer};
use crate::domain::chemistry::{canonicalize_list, SmilesGrammar};
use crate::infra::{checkpoint::CheckpointManager, tokenizer_store::TokenizerStore};
use crate::ml::generation::SamplingConfig;
use crate::ml::model::{Jointformer, JointformerConfig};
use crate::ml::precision::DeviceKind;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub checkpoint_dir: PathBuf,
    pub num_samples:    usize,
    pub batch_size:     usize,
    pub sampling:       SamplingConfig,
    pub seed:           u64,
    pub device:         String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    /// Decoded samples in generation order, invalid ones included
    pub smiles:         Vec<String>,
    pub valid_fraction: f64,
    /// Canonical form of every valid sample, first occurrence only
    pub unique_valid:   Vec<String>,
}

// ─── TrainedRun ───────────────────────────────────────────────────────────────
/// The saved model config and tokenizer of a finished run.
pub(crate) struct TrainedRun {
    pub store:        CheckpointManager,
    pub model_config: JointformerConfig,
    pub tokenizer:    SmilesTokenizer,
}

impl TrainedRun {
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        let store = CheckpointManager::open(dir)?;
        let model_config = store.load_model_config()?;
        let tokenizer = TokenizerStore::new(dir).load()?;
        let tokenizer = SmilesTokenizer::new(tokenizer, model_config.max_seq_len)?
            .with_start_token(model_config.pooling.needs_start_token());
        if tokenizer.vocab_size() != model_config.vocab_size {
            bail!(
                "Tokenizer has {} tokens but the model was trained with {}",
                tokenizer.vocab_size(),
                model_config.vocab_size
            );
        }
        Ok(Self { store, model_config, tokenizer })
    }

    /// Rebuild the model and load `model.mpk` onto `device`.
    pub(crate) fn load_model<B: Backend>(&self, device: &B::Device) -> Result<Jointformer<B>> {
        let model = self.store.load_model(self.model_config.init::<B>(device)?, device)?;
        tracing::info!("Loaded model from '{}'", self.store.dir().display());
        Ok(model)
    }
}

pub struct GenerateUseCase {
    request: GenerateRequest,
}

impl GenerateUseCase {
    pub fn new(request: GenerateRequest) -> Self {
        Self { request }
    }

    pub fn execute(&self) -> Result<GenerationReport> {
        let req = &self.request;
        req.sampling.validate()?;
        if req.batch_size == 0 {
            bail!("batch size must be greater than 0");
        }

        // ── Step 1: Configs and tokenizer ─────────────────────────────────────
        let run = TrainedRun::open(&req.checkpoint_dir)?;

        match DeviceKind::from_str(&req.device)? {
            DeviceKind::Cpu => self.sample::<NdArray>(&run, NdArrayDevice::Cpu),
            DeviceKind::Gpu => self.sample::<Wgpu>(&run, WgpuDevice::default()),
        }
    }

    fn sample<B: Backend>(&self, run: &TrainedRun, device: B::Device) -> Result<GenerationReport> {
        let req = &self.request;
        let tokenizer = &run.tokenizer;

        // ── Step 2: Model ─────────────────────────────────────────────────────
        let model = run.load_model::<B>(&device)?;

        // ── Step 3: Sample ────────────────────────────────────────────────────
        let mut rng = StdRng::seed_from_u64(req.seed);
        let mut sequences = Vec::with_capacity(req.num_samples);
        while sequences.len() < req.num_samples {
            let batch = req.batch_size.min(req.num_samples - sequences.len());
            sequences.extend(model.generate(tokenizer, batch, &req.sampling, &device, &mut rng)?);
            tracing::debug!("Generated {}/{} samples", sequences.len(), req.num_samples);
        }

        // ── Step 4: Decode and score ──────────────────────────────────────────
        let checker = SmilesGrammar::new();
        let smiles: Vec<String> = sequences.iter().map(|s| tokenizer.decode(s)).collect();
        let valid_fraction = tokenizer.is_valid_smiles(&sequences, &checker);
        let unique_valid = canonicalize_list(&checker, &smiles);

        tracing::info!(
            "{} samples, {:.1}% valid, {} unique valid",
            smiles.len(),
            valid_fraction * 100.0,
            unique_valid.len()
        );
        Ok(GenerationReport { smiles, valid_fraction, unique_valid })
    }
}
