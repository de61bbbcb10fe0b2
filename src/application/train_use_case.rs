// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates a training run in order:
//
//   Step 1: Load molecules and split train/val   (Layer 4 - data)
//   Step 2: Build / load the tokenizer           (Layer 6 - infra)
//   Step 3: Derive the model config              (Layer 5 - ml)
//   Step 4: Save configs next to the checkpoint  (Layer 6 - infra)
//   Step 5: Pick the backend and start replicas  (Layer 5 - ml)
//
// Backends:
//   device "cpu"               → Autodiff<NdArray>
//   gpu device, float16        → Autodiff<Wgpu<f16>>
//   gpu device, anything else  → Autodiff<Wgpu>
//
// With ddp_enabled and ddp_world_size > 1 every replica runs on
// its own thread with its own copy of the initial weights.
//
// Reference: Burn Book §5 (Training)

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    module::Module,
    tensor::{backend::AutodiffBackend, f16},
};
use std::{str::FromStr, sync::Arc, thread};

use crate::application::config::{InitFrom, RunConfig};
use crate::data::{
    dataset::SmilesDataset,
    loader::SmilesFileLoader,
    splitter::split_train_val,
    tokenizer::SmilesTokenizer,
};
use crate::domain::chemistry::SmilesGrammar;
use crate::domain::molecule::Molecule;
use crate::domain::task::LossTask;
use crate::domain::traits::MoleculeSource;
use crate::infra::{checkpoint::CheckpointManager, tokenizer_store::TokenizerStore};
use crate::ml::distributed::DistributedContext;
use crate::ml::model::{Jointformer, JointformerConfig};
use crate::ml::precision::{DeviceKind, Precision};
use crate::ml::trainer::{SharedDataset, TrainSummary, Trainer};

pub struct TrainUseCase {
    config: RunConfig,
}

impl TrainUseCase {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<TrainSummary> {
        let run = &self.config;
        let trainer = &run.trainer;
        trainer.validate()?;

        // ── Step 1: Load molecules ────────────────────────────────────────────
        let molecules = SmilesFileLoader::new(&run.data.train_path).load_all()?;
        if molecules.is_empty() {
            bail!("No molecules found in '{}'", run.data.train_path);
        }
        let (train, val) = match &run.data.val_path {
            Some(path) => (molecules, SmilesFileLoader::new(path).load_all()?),
            None => split_train_val(molecules, run.data.train_fraction, trainer.seed),
        };
        if train.is_empty() || val.is_empty() {
            bail!(
                "Need molecules in both splits (train {}, val {}); adjust data.train_fraction or set data.val_path",
                train.len(),
                val.len()
            );
        }
        tracing::info!("{} training and {} validation molecules", train.len(), val.len());

        // ── Step 2: Tokenizer ─────────────────────────────────────────────────
        let smiles: Vec<String> = train.iter().map(|m| m.smiles.clone()).collect();
        let tokenizer = TokenizerStore::new(&trainer.out_dir)
            .load_or_build(&smiles, run.data.max_vocab_size)?;
        let tokenizer = SmilesTokenizer::new(tokenizer, run.data.max_molecule_length)?
            .with_mlm_probability(run.data.mlm_probability);
        tracing::info!("Vocabulary size: {}", tokenizer.vocab_size());

        // ── Step 3: Model config ──────────────────────────────────────────────
        let store = CheckpointManager::new(&trainer.out_dir)?;
        let model_config = match trainer.init_from {
            InitFrom::Scratch => run
                .model
                .to_model_config(tokenizer.vocab_size(), run.data.max_molecule_length),
            // The saved config is the one the weights were trained with
            InitFrom::Resume => store.load_model_config()?,
        };
        model_config.validate()?;
        check_property_targets(run, &model_config, &train)?;
        let tokenizer = tokenizer.with_start_token(model_config.pooling.needs_start_token());

        // ── Step 4: Save configs ──────────────────────────────────────────────
        store.save_model_config(&model_config)?;
        store.save_trainer_config(run)?;

        // ── Step 5: Backend and replicas ──────────────────────────────────────
        let job = TrainJob {
            run:          run.clone(),
            model_config,
            train:        Arc::new(SmilesDataset::new(train)),
            val:          Arc::new(SmilesDataset::new(val)),
            tokenizer:    Arc::new(tokenizer),
        };

        let device_kind = DeviceKind::from_str(&trainer.device)?;
        match (device_kind, trainer.dtype) {
            (DeviceKind::Cpu, _) => job.run_replicas::<Autodiff<NdArray>>(NdArrayDevice::Cpu),
            (DeviceKind::Gpu, Precision::Float16) => {
                job.run_replicas::<Autodiff<Wgpu<f16>>>(WgpuDevice::default())
            }
            (DeviceKind::Gpu, _) => job.run_replicas::<Autodiff<Wgpu>>(WgpuDevice::default()),
        }
    }
}

/// Property tasks need every molecule to carry as many values as the head predicts.
fn check_property_targets(run: &RunConfig, model: &JointformerConfig, train: &[Molecule]) -> Result<()> {
    let weight = |task| run.trainer.task_probabilities.get(&task).copied().unwrap_or(0.0);
    let required = [
        (LossTask::Prediction, model.num_prediction_tasks),
        (LossTask::Physchem, model.num_physchem_tasks),
    ];

    for (task, expected) in required {
        if weight(task) <= 0.0 {
            continue;
        }
        if let Some(m) = train.iter().find(|m| m.properties.len() != expected) {
            bail!(
                "{task} training needs {expected} property values per molecule but `{}` has {}",
                m.smiles,
                m.properties.len()
            );
        }
    }
    Ok(())
}

// ─── TrainJob ─────────────────────────────────────────────────────────────────
/// Everything a replica needs, independent of the backend.
struct TrainJob {
    run:          RunConfig,
    model_config: JointformerConfig,
    train:        SharedDataset,
    val:          SharedDataset,
    tokenizer:    Arc<SmilesTokenizer>,
}

impl TrainJob {
    fn run_replicas<B: AutodiffBackend>(&self, device: B::Device) -> Result<TrainSummary> {
        let world_size = self.run.trainer.world_size();
        tracing::info!(
            "Starting {} replica(s) on {:?} ({:?} process group)",
            world_size,
            device,
            self.run.trainer.ddp_backend
        );

        // One initialisation, copied to every replica
        let model = self.model_config.init::<B>(&device)?;

        if world_size == 1 {
            return self.replica(model, DistributedContext::single_process(), device);
        }

        thread::scope(|scope| {
            let handles: Vec<_> = DistributedContext::local_group(world_size)
                .into_iter()
                .map(|dist| {
                    let model = model.clone().fork(&device);
                    let device = device.clone();
                    scope.spawn(move || {
                        let rank = dist.rank;
                        let result = self.replica(model, dist.clone(), device);
                        if let Err(e) = &result {
                            tracing::error!("Replica {rank} failed: {e:#}");
                            dist.group().abort(&format!("replica {rank} failed"));
                        }
                        result
                    })
                })
                .collect();

            let summaries = handles
                .into_iter()
                .map(|h| h.join().map_err(|_| anyhow!("training replica panicked"))?)
                .collect::<Result<Vec<_>>>()?;
            summaries.into_iter().next().context("no replica finished")
        })
    }

    fn replica<B: AutodiffBackend>(
        &self,
        model:  Jointformer<B>,
        dist:   DistributedContext,
        device: B::Device,
    ) -> Result<TrainSummary> {
        let mut trainer = Trainer::new(
            self.run.trainer.clone(),
            model,
            self.train.clone(),
            self.val.clone(),
            self.tokenizer.clone(),
            Arc::new(SmilesGrammar::new()),
            dist,
            device,
        )?;
        trainer.train()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BTreeMap, fs};

    use crate::application::config::TrainerConfig;

    fn run_config(dir: &std::path::Path) -> RunConfig {
        let data = dir.join("molecules.csv");
        fs::write(
            &data,
            "smiles,a,b\nCCO,0.1,0.2\nCCN,0.3,0.4\nc1ccccc1,0.5,0.6\nCC(=O)O,0.7,0.8\nCCCl,0.9,1.0\nCOC,1.1,1.2\n",
        )
        .unwrap();

        let mut run = RunConfig::default();
        run.data.train_path = data.to_string_lossy().into_owned();
        run.data.train_fraction = 0.5;
        run.data.max_molecule_length = 8;
        run.model.embedding_dim = 8;
        run.model.embedding_hidden_dim = 16;
        run.model.num_layers = 1;
        run.model.num_heads = 2;
        run.model.prediction_hidden_dim = 4;
        run.model.num_prediction_tasks = 2;
        run.model.num_physchem_tasks = 2;
        run.trainer = TrainerConfig {
            out_dir:        dir.join("out").to_string_lossy().into_owned(),
            eval_interval:  2,
            eval_iters:     1,
            max_iters:      2,
            batch_size:     2,
            warmup_iters:   1,
            lr_decay_iters: 2,
            ..TrainerConfig::default()
        };
        run
    }

    #[test]
    fn test_cpu_run_writes_checkpoint_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run = run_config(dir.path());
        let summary = TrainUseCase::new(run).execute().unwrap();
        assert_eq!(summary.iterations, 3);

        let out = dir.path().join("out");
        for file in ["tokenizer.json", "model_config.json", "trainer_config.json", "metrics.csv", "model.mpk"] {
            assert!(out.join(file).exists(), "missing {file}");
        }
    }

    #[test]
    fn test_prefix_pooling_run_then_generate() {
        use crate::application::generate_use_case::{GenerateRequest, GenerateUseCase};
        use crate::ml::generation::SamplingConfig;
        use crate::ml::pooling::Pooling;

        let dir = tempfile::tempdir().unwrap();
        let mut run = run_config(dir.path());
        run.model.pooling = Pooling::Prefix;
        let summary = TrainUseCase::new(run).execute().unwrap();
        assert_eq!(summary.iterations, 3);

        let report = GenerateUseCase::new(GenerateRequest {
            checkpoint_dir: dir.path().join("out"),
            num_samples:    3,
            batch_size:     2,
            sampling:       SamplingConfig::default(),
            seed:           1,
            device:         "cpu".into(),
        })
        .execute()
        .unwrap();
        assert_eq!(report.smiles.len(), 3);
    }

    #[test]
    fn test_two_thread_replicas_train_together() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_config(dir.path());
        run.trainer.ddp_enabled = true;
        run.trainer.ddp_world_size = 2;
        run.trainer.gradient_accumulation_steps = 2;
        run.trainer.task_probabilities = BTreeMap::from([(LossTask::Lm, 1.0), (LossTask::Physchem, 1.0)]);

        let summary = TrainUseCase::new(run).execute().unwrap();
        assert_eq!(summary.iterations, 3);
    }

    #[test]
    fn test_property_count_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_config(dir.path());
        run.model.num_prediction_tasks = 3;
        run.trainer.task_probabilities = BTreeMap::from([(LossTask::Prediction, 1.0)]);

        let err = TrainUseCase::new(run).execute().unwrap_err();
        assert!(err.to_string().contains("property values"));
    }

    #[test]
    fn test_missing_data_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_config(dir.path());
        run.data.train_path = dir.path().join("nope.csv").to_string_lossy().into_owned();
        assert!(TrainUseCase::new(run).execute().is_err());
    }
}
