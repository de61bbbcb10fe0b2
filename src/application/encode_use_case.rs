// ============================================================
// Layer 2 — EncodeUseCase
// ============================================================
// Turns SMILES into fixed-size molecule embeddings with a trained
// checkpoint, for use by downstream models:
//
//   Step 1: Read model_config.json and tokenizer.json
//   Step 2: Rebuild the model and load model.mpk
//   Step 3: Tokenize in [PREDICT] layout, batch by batch
//   Step 4: Bidirectional forward, keep the pooled CLS view
//
// One row of `embedding_dim` values per input molecule, in input
// order. Pooling (cls / prefix / max_pooled) is whatever the
// model was trained with.

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, NdArray, Wgpu},
    prelude::*,
};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::application::generate_use_case::TrainedRun;
use crate::ml::precision::DeviceKind;

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub checkpoint_dir: PathBuf,
    pub smiles:         Vec<String>,
    pub batch_size:     usize,
    pub device:         String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    pub smiles: Vec<String>,
    pub dim:    usize,
    /// `smiles.len()` rows of `dim` values
    pub rows:   Vec<Vec<f32>>,
}

impl Embeddings {
    /// CSV with a `smiles,e0,e1,...` header.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = fs::File::create(path)
            .with_context(|| format!("Cannot create '{}'", path.display()))?;

        let header: Vec<String> = (0..self.dim).map(|i| format!("e{i}")).collect();
        writeln!(file, "smiles,{}", header.join(","))?;
        for (smiles, row) in self.smiles.iter().zip(&self.rows) {
            let values: Vec<String> = row.iter().map(|v| format!("{v:.6}")).collect();
            writeln!(file, "{},{}", smiles, values.join(","))?;
        }
        Ok(())
    }
}

pub struct EncodeUseCase {
    request: EncodeRequest,
}

impl EncodeUseCase {
    pub fn new(request: EncodeRequest) -> Self {
        Self { request }
    }

    pub fn execute(&self) -> Result<Embeddings> {
        let req = &self.request;
        if req.batch_size == 0 {
            bail!("batch size must be greater than 0");
        }

        // ── Step 1: Configs and tokenizer ─────────────────────────────────────
        let run = TrainedRun::open(&req.checkpoint_dir)?;

        match DeviceKind::from_str(&req.device)? {
            DeviceKind::Cpu => self.encode::<NdArray>(&run, NdArrayDevice::Cpu),
            DeviceKind::Gpu => self.encode::<Wgpu>(&run, WgpuDevice::default()),
        }
    }

    fn encode<B: Backend>(&self, run: &TrainedRun, device: B::Device) -> Result<Embeddings> {
        let req = &self.request;
        let dim = run.model_config.embedding_dim;

        // ── Step 2: Model ─────────────────────────────────────────────────────
        let model = run.load_model::<B>(&device)?;

        // ── Step 3 + 4: Tokenize and pool, batch by batch ─────────────────────
        let mut rows = Vec::with_capacity(req.smiles.len());
        for chunk in req.smiles.chunks(req.batch_size) {
            let inputs = run.tokenizer.encode_unlabelled(chunk)?.into_tensors::<B>(&device);
            let embeddings = model.encode(inputs.input_ids, Some(inputs.attention_mask))?;
            let values = embeddings
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| anyhow!("cannot read embeddings: {e:?}"))?;
            rows.extend(values.chunks(dim).map(<[f32]>::to_vec));
            tracing::debug!("Encoded {}/{} molecules", rows.len(), req.smiles.len());
        }

        tracing::info!("Encoded {} molecules into {}-dim embeddings", rows.len(), dim);
        Ok(Embeddings { smiles: req.smiles.clone(), dim, rows })
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    use crate::infra::{checkpoint::CheckpointManager, tokenizer_store::TokenizerStore};
    use crate::ml::model::JointformerConfig;
    use crate::ml::pooling::Pooling;

    fn write_checkpoint(dir: &Path, pooling: Pooling) {
        let smiles: Vec<String> = ["CCO", "c1ccccc1", "CC(=O)N"].iter().map(|s| s.to_string()).collect();
        let tokenizer = TokenizerStore::new(dir).load_or_build(&smiles, None).unwrap();

        let config = JointformerConfig::new(tokenizer.get_vocab_size(true), 8)
            .with_embedding_dim(8)
            .with_embedding_hidden_dim(16)
            .with_num_layers(1)
            .with_num_heads(2)
            .with_num_physchem_tasks(2)
            .with_pooling(pooling);
        let store = CheckpointManager::new(dir).unwrap();
        store.save_model_config(&config).unwrap();
        store.save_model(&config.init::<NdArray>(&Default::default()).unwrap()).unwrap();
    }

    fn request(dir: &Path, smiles: &[&str], batch_size: usize) -> EncodeRequest {
        EncodeRequest {
            checkpoint_dir: dir.to_path_buf(),
            smiles:         smiles.iter().map(|s| s.to_string()).collect(),
            batch_size,
            device:         "cpu".into(),
        }
    }

    #[test]
    fn test_one_row_per_molecule() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), Pooling::Cls);

        let embeddings = EncodeUseCase::new(request(dir.path(), &["CCO", "c1ccccc1", "CCN"], 2))
            .execute()
            .unwrap();
        assert_eq!(embeddings.dim, 8);
        assert_eq!(embeddings.rows.len(), 3);
        assert!(embeddings.rows.iter().all(|r| r.len() == 8 && r.iter().all(|v| v.is_finite())));
    }

    #[test]
    fn test_batching_does_not_change_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), Pooling::MaxPooled);
        let smiles = ["CCO", "c1ccccc1", "CC(=O)N"];

        let one = EncodeUseCase::new(request(dir.path(), &smiles, 1)).execute().unwrap();
        let all = EncodeUseCase::new(request(dir.path(), &smiles, 3)).execute().unwrap();
        for (a, b) in one.rows.iter().zip(&all.rows) {
            for (x, y) in a.iter().zip(b) {
                approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_prefix_checkpoint_and_csv_output() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), Pooling::Prefix);

        let embeddings = EncodeUseCase::new(request(dir.path(), &["CCO"], 4)).execute().unwrap();
        let csv = dir.path().join("embeddings.csv");
        embeddings.write_csv(&csv).unwrap();

        let text = fs::read_to_string(&csv).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("smiles,e0,e1"));
        assert_eq!(lines[1].split(',').count(), 9);
    }

    #[test]
    fn test_missing_checkpoint_and_zero_batch() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EncodeUseCase::new(request(&dir.path().join("none"), &["CCO"], 1)).execute().is_err());

        write_checkpoint(dir.path(), Pooling::Cls);
        assert!(EncodeUseCase::new(request(dir.path(), &["CCO"], 0)).execute().is_err());
    }
}
