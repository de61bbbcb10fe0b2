// ============================================================
// Layer 5 — Training Loop
// ============================================================
// One replica of a (possibly data-parallel) Jointformer run.
//
//   new ──► loop {
//             eval + checkpoint   (leader, every eval_interval)
//             train_step          (all replicas)
//             log                 (leader, every log_interval)
//           } until iter_num > max_iters
//
// A train step:
//   1. for each of `accumulation_steps` micro-batches: sample a
//      task, tokenize a random batch, loss / steps, scale, backward,
//      accumulate
//   2. mean all-reduce of the gradients across replicas (the only
//      point where replicas wait on each other)
//   3. unscale; on inf/NaN skip the update and back off the scale
//   4. clip to `grad_clip` global norm
//   5. AdamW step at the scheduled learning rate
//
// Evaluation runs on model.valid(): the inner backend records no
// graph and dropout is inactive there. The autodiff model itself
// is never switched, so training mode needs no restoring.
//
// Reference: Burn Book §5, Loshchilov & Hutter (2019) AdamW

use anyhow::{anyhow, Context, Result};
use burn::{
    data::dataset::Dataset,
    module::{AutodiffModule, Module},
    optim::{GradientsAccumulator, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    Rng, SeedableRng,
};
use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::application::config::{InitFrom, TrainerConfig};
use crate::data::tokenizer::TaskTokenizer;
use crate::domain::molecule::Molecule;
use crate::domain::task::LossTask;
use crate::domain::traits::ValidityChecker;
use crate::infra::checkpoint::{CheckpointManager, CheckpointState};
use crate::infra::metrics::{EvalMetrics, MetricsLogger};
use crate::ml::distributed::DistributedContext;
use crate::ml::generation::SamplingConfig;
use crate::ml::grads::{all_reduce_mean, clip_global_norm, unscale_and_check};
use crate::ml::model::{Jointformer, JointformerOptimizer};
use crate::ml::precision::{DeviceKind, LossScaler, PrecisionContext};
use crate::ml::schedule::LrSchedule;

pub type SharedDataset = Arc<dyn Dataset<Molecule>>;

// ─── TaskSampler ──────────────────────────────────────────────────────────────
/// Draws the task of each micro-batch from the configured weights.
#[derive(Debug, Clone)]
pub struct TaskSampler {
    tasks:   Vec<LossTask>,
    weights: WeightedIndex<f64>,
}

impl TaskSampler {
    /// Tasks with zero weight are never drawn.
    pub fn new(probabilities: &BTreeMap<LossTask, f64>) -> Result<Self> {
        let (tasks, weights): (Vec<LossTask>, Vec<f64>) = probabilities
            .iter()
            .filter(|(_, p)| **p > 0.0)
            .map(|(&task, &p)| (task, p))
            .unzip();
        let weights = WeightedIndex::new(&weights)
            .context("task_probabilities must contain at least one positive weight")?;
        Ok(Self { tasks, weights })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> LossTask {
        self.tasks[self.weights.sample(rng)]
    }

    pub fn tasks(&self) -> &[LossTask] {
        &self.tasks
    }
}

// ─── Reports ──────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub train_loss:     f64,
    pub val_loss:       f64,
    pub valid_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Sum of the micro-batch losses, each divided by the step count
    pub loss:      f64,
    /// Global norm before clipping; `None` when clipping is off or the step was skipped
    pub grad_norm: Option<f64>,
    /// True when the update was dropped because of inf/NaN gradients
    pub skipped:   bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub iterations:    usize,
    pub best_val_loss: f64,
    pub last_loss:     Option<f64>,
    pub skipped_steps: usize,
    pub elapsed:       Duration,
}

// ─── Trainer ──────────────────────────────────────────────────────────────────
pub struct Trainer<B, T, V>
where
    B: AutodiffBackend,
    T: TaskTokenizer,
    V: ValidityChecker + ?Sized,
{
    config:             TrainerConfig,
    model:              Jointformer<B>,
    optimizer:          JointformerOptimizer<B>,
    train_dataset:      SharedDataset,
    val_dataset:        SharedDataset,
    tokenizer:          Arc<T>,
    checker:            Arc<V>,
    dist:               DistributedContext,
    precision:          PrecisionContext,
    scaler:             LossScaler,
    schedule:           LrSchedule,
    tasks:              TaskSampler,
    accumulation_steps: usize,
    state:              CheckpointState,
    store:              CheckpointManager,
    metrics:            Option<MetricsLogger>,
    rng:                StdRng,
    device:             B::Device,
}

impl<B, T, V> Trainer<B, T, V>
where
    B: AutodiffBackend,
    T: TaskTokenizer,
    V: ValidityChecker + ?Sized,
{
    /// Build one replica. Every replica of a run must receive identical
    /// model weights; `dist` tells this replica its rank.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config:        TrainerConfig,
        model:         Jointformer<B>,
        train_dataset: SharedDataset,
        val_dataset:   SharedDataset,
        tokenizer:     Arc<T>,
        checker:       Arc<V>,
        dist:          DistributedContext,
        device:        B::Device,
    ) -> Result<Self> {
        config.validate()?;

        // ── Precision ─────────────────────────────────────────────────────────
        let device_kind = DeviceKind::from_str(&config.device)?;
        let precision = PrecisionContext::resolve(config.dtype, device_kind);
        let scaler = precision.scaler();

        // ── Accumulation split across replicas ────────────────────────────────
        let accumulation_steps = dist
            .per_replica_accumulation(config.gradient_accumulation_steps)
            .context("gradient_accumulation_steps does not split across replicas")?;

        if config.compile {
            tracing::warn!("compile is not supported by this backend, running uncompiled");
        }

        model
            .pooling()
            .check_seq_len(tokenizer.generation_prefix().len())
            .context("the tokenizer's generation prefix is too short for this model")?;

        let tasks = TaskSampler::new(&config.task_probabilities)?;
        let rng = StdRng::seed_from_u64(config.seed + dist.rank as u64);
        let store = CheckpointManager::new(&config.out_dir)?;
        let metrics = if dist.is_leader() {
            Some(MetricsLogger::new(&config.out_dir)?)
        } else {
            None
        };

        // ── Model, optimizer and state ────────────────────────────────────────
        let mut model = model;
        let mut optimizer = model.configure_optimizer(config.weight_decay, config.beta1, config.beta2);
        let mut state = CheckpointState::default();

        if config.init_from == InitFrom::Resume {
            tracing::info!("Resuming from '{}'", store.dir().display());
            model = store.load_model(model, &device)?;
            optimizer = store.load_optimizer(optimizer, &device)?;
            state = store.load_state()?;
            tracing::info!(
                "Resumed at iter {} (best val loss {:.4})",
                state.iter_num,
                state.best_val_loss
            );
        }

        if dist.is_leader() {
            let tokens_per_iter = accumulation_steps
                * dist.world_size
                * config.batch_size
                * tokenizer.max_molecule_length();
            tracing::info!(
                "Tokens per iteration: {} ({} replicas x {} steps x {} batch x {} tokens)",
                tokens_per_iter,
                dist.world_size,
                accumulation_steps,
                config.batch_size,
                tokenizer.max_molecule_length()
            );
            tracing::info!("Precision: {} (requested {})", precision.effective, precision.requested);
            tracing::info!("Model parameters: {}", model.num_params());
        }

        let schedule = config.lr_schedule();
        Ok(Self {
            config,
            model,
            optimizer,
            train_dataset,
            val_dataset,
            tokenizer,
            checker,
            dist,
            precision,
            scaler,
            schedule,
            tasks,
            accumulation_steps,
            state,
            store,
            metrics,
            rng,
            device,
        })
    }

    // ── Train step ────────────────────────────────────────────────────────────
    /// One optimizer update at learning rate `lr`.
    pub fn train_step(&mut self, lr: f64) -> Result<StepOutcome> {
        let mut accumulator = GradientsAccumulator::<Jointformer<B>>::new();
        let mut loss_sum = 0.0;

        for _ in 0..self.accumulation_steps {
            let task = self.tasks.sample(&mut self.rng);
            let inputs = self.tokenizer.get_inputs::<B, _, _>(
                self.train_dataset.as_ref(),
                task,
                self.config.batch_size,
                &self.device,
                &mut self.rng,
            )?;
            let (input_ids, attention_mask, target) = inputs.into_loss_args();

            let output = self.model.get_loss(input_ids, Some(attention_mask), target)?;
            let loss = output
                .loss
                .ok_or_else(|| anyhow!("{task} batch produced no loss"))?
                .div_scalar(self.accumulation_steps as f64);
            let value = loss.clone().into_scalar().elem::<f64>();
            tracing::trace!("Micro-batch {task}: loss {value:.4}");
            loss_sum += value;

            let grads = self.scaler.scale_loss(loss).backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            accumulator.accumulate(&self.model, grads);
        }

        let mut grads = accumulator.grads();

        if self.dist.is_distributed() {
            all_reduce_mean::<B, _>(&self.model, &mut grads, self.dist.group(), &self.device)?;
        }

        if self.scaler.is_enabled() {
            let scale = self.scaler.scale();
            let finite = unscale_and_check::<B, _>(&self.model, &mut grads, scale);
            self.scaler.update(!finite);
            if !finite {
                tracing::warn!("Non-finite gradients at loss scale {scale}, skipping step");
                return Ok(StepOutcome { loss: loss_sum, grad_norm: None, skipped: true });
            }
        }

        let grad_norm = (self.config.grad_clip > 0.0)
            .then(|| clip_global_norm::<B, _>(&self.model, &mut grads, self.config.grad_clip));

        self.model = self.optimizer.step(lr, self.model.clone(), grads);

        Ok(StepOutcome { loss: loss_sum, grad_norm, skipped: false })
    }

    // ── Evaluation ────────────────────────────────────────────────────────────
    /// Mean LM loss on both splits plus the validity of freshly generated molecules.
    pub fn estimate_loss(&mut self) -> Result<EvalReport> {
        let model = self.model.valid();
        let eval_iters = self.config.eval_iters;
        let batch_size = self.config.batch_size;

        let mut losses = [0.0; 2];
        for (slot, dataset) in [&self.train_dataset, &self.val_dataset].into_iter().enumerate() {
            let mut total = 0.0;
            for _ in 0..eval_iters {
                let inputs = self.tokenizer.get_inputs::<B::InnerBackend, _, _>(
                    dataset.as_ref(),
                    LossTask::Lm,
                    batch_size,
                    &self.device,
                    &mut self.rng,
                )?;
                let (input_ids, attention_mask, target) = inputs.into_loss_args();
                total += model
                    .get_loss(input_ids, Some(attention_mask), target)?
                    .loss_value()
                    .ok_or_else(|| anyhow!("evaluation batch produced no loss"))?;
            }
            losses[slot] = total / eval_iters as f64;
        }

        let prefix = self.tokenizer.generation_prefix();
        let sampling = SamplingConfig::default();
        let mut sequences = Vec::with_capacity(eval_iters * batch_size);
        for _ in 0..eval_iters {
            sequences.extend(model.generate_from_prefix(
                &prefix,
                batch_size,
                self.tokenizer.max_molecule_length(),
                &sampling,
                self.tokenizer.sep_token_id(),
                self.tokenizer.pad_token_id(),
                &self.device,
                &mut self.rng,
            )?);
        }
        let valid_fraction = self.tokenizer.is_valid_smiles(&sequences, self.checker.as_ref());

        Ok(EvalReport { train_loss: losses[0], val_loss: losses[1], valid_fraction })
    }

    /// Leader only: evaluate, log, and checkpoint when due.
    fn evaluate(&mut self, lr: f64) -> Result<EvalReport> {
        let report = self.estimate_loss()?;
        let iter = self.state.iter_num;
        tracing::info!(
            "step {}: train loss {:.4}, val loss {:.4}, valid {:.1}%",
            iter,
            report.train_loss,
            report.val_loss,
            report.valid_fraction * 100.0
        );

        if let Some(metrics) = &self.metrics {
            metrics.log(&EvalMetrics {
                iter,
                train_loss:     report.train_loss,
                val_loss:       report.val_loss,
                valid_fraction: report.valid_fraction,
                lr,
            })?;
        }

        if report.val_loss < self.state.best_val_loss || self.config.always_save_checkpoint {
            self.state.best_val_loss = report.val_loss;
            if iter > 0 {
                self.store.save_checkpoint(&self.model, &self.optimizer, &self.state)?;
            }
        }
        Ok(report)
    }

    // ── Main loop ─────────────────────────────────────────────────────────────
    pub fn train(&mut self) -> Result<TrainSummary> {
        let started = Instant::now();
        let is_leader = self.dist.is_leader();
        let mut last_loss = None;
        let mut skipped_steps = 0;

        if self.config.eval_only {
            if is_leader {
                let lr = self.schedule.lr(self.state.iter_num);
                self.evaluate(lr)?;
            }
            return Ok(self.summary(started, last_loss, skipped_steps));
        }

        let mut step_started = Instant::now();
        loop {
            let iter = self.state.iter_num;
            let lr = self.schedule.lr(iter);

            if is_leader && iter % self.config.eval_interval == 0 {
                self.evaluate(lr)?;
            }

            let outcome = self.train_step(lr)?;
            last_loss = Some(outcome.loss);
            if outcome.skipped {
                skipped_steps += 1;
            }

            if is_leader && iter % self.config.log_interval == 0 {
                let elapsed = step_started.elapsed();
                tracing::info!(
                    "iter {}: loss {:.4}, lr {:.3e}, time {:.2}ms{}",
                    iter,
                    outcome.loss,
                    lr,
                    elapsed.as_secs_f64() * 1000.0,
                    outcome.grad_norm.map(|n| format!(", grad norm {n:.3}")).unwrap_or_default()
                );
            }
            step_started = Instant::now();

            self.state.iter_num += 1;
            if self.state.iter_num > self.config.max_iters {
                break;
            }
        }

        let summary = self.summary(started, last_loss, skipped_steps);
        if is_leader {
            tracing::info!(
                "Training finished after {} iterations in {:.1}s (best val loss {:.4})",
                summary.iterations,
                summary.elapsed.as_secs_f64(),
                summary.best_val_loss
            );
        }
        Ok(summary)
    }

    fn summary(&self, started: Instant, last_loss: Option<f64>, skipped_steps: usize) -> TrainSummary {
        TrainSummary {
            iterations: self.state.iter_num,
            best_val_loss: self.state.best_val_loss,
            last_loss,
            skipped_steps,
            elapsed: started.elapsed(),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────
    pub fn model(&self) -> &Jointformer<B> {
        &self.model
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    pub fn precision(&self) -> PrecisionContext {
        self.precision
    }

    pub fn accumulation_steps(&self) -> usize {
        self.accumulation_steps
    }

    pub fn loss_scale(&self) -> f64 {
        self.scaler.scale()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use std::fs;

    use crate::data::dataset::SmilesDataset;
    use crate::data::tokenizer::SmilesTokenizer;
    use crate::domain::chemistry::SmilesGrammar;
    use crate::infra::tokenizer_store::build_tokenizer;
    use crate::ml::model::JointformerConfig;
    use crate::ml::pooling::Pooling;
    use crate::ml::precision::Precision;

    type TestBackend = Autodiff<NdArray>;
    type TestTrainer = Trainer<TestBackend, SmilesTokenizer, SmilesGrammar>;

    const MAX_LEN: usize = 8;

    fn molecules() -> Vec<Molecule> {
        vec![
            Molecule::new("CCO", vec![0.5, 1.0]),
            Molecule::new("c1ccccc1", vec![1.5, 0.0]),
            Molecule::new("CC(=O)N", vec![-2.0, 3.0]),
            Molecule::new("CCCl", vec![0.1, 0.2]),
        ]
    }

    fn tokenizer() -> SmilesTokenizer {
        let smiles: Vec<String> = molecules().into_iter().map(|m| m.smiles).collect();
        SmilesTokenizer::new(build_tokenizer(&smiles, None).unwrap(), MAX_LEN).unwrap()
    }

    fn model(vocab_size: usize) -> Jointformer<TestBackend> {
        model_config(vocab_size).init(&Default::default()).unwrap()
    }

    fn model_config(vocab_size: usize) -> JointformerConfig {
        JointformerConfig::new(vocab_size, MAX_LEN)
            .with_embedding_dim(8)
            .with_embedding_hidden_dim(16)
            .with_num_layers(1)
            .with_num_heads(2)
            .with_prediction_hidden_dim(4)
            .with_num_prediction_tasks(2)
            .with_num_physchem_tasks(2)
            .with_attention_dropout(0.0)
            .with_feed_forward_dropout(0.0)
    }

    fn base_config(out_dir: &std::path::Path) -> TrainerConfig {
        TrainerConfig {
            out_dir:        out_dir.to_string_lossy().into_owned(),
            eval_interval:  2,
            eval_iters:     1,
            max_iters:      3,
            batch_size:     2,
            warmup_iters:   1,
            lr_decay_iters: 3,
            learning_rate:  1e-2,
            min_lr:         1e-3,
            ..TrainerConfig::default()
        }
    }

    fn trainer(config: TrainerConfig, dist: DistributedContext) -> Result<TestTrainer> {
        let tokenizer = tokenizer();
        let model = model(tokenizer.vocab_size());
        trainer_with(config, model, tokenizer, dist)
    }

    fn trainer_with(
        config:    TrainerConfig,
        model:     Jointformer<TestBackend>,
        tokenizer: SmilesTokenizer,
        dist:      DistributedContext,
    ) -> Result<TestTrainer> {
        let dataset: SharedDataset = Arc::new(SmilesDataset::new(molecules()));
        Trainer::new(
            config,
            model,
            dataset.clone(),
            dataset,
            Arc::new(tokenizer),
            Arc::new(SmilesGrammar::new()),
            dist,
            Default::default(),
        )
    }

    #[test]
    fn test_task_sampler_skips_zero_weights() {
        let sampler = TaskSampler::new(&BTreeMap::from([
            (LossTask::Lm, 0.0),
            (LossTask::Mlm, 2.0),
        ]))
        .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(sampler.tasks(), &[LossTask::Mlm]);
        assert!((0..50).all(|_| sampler.sample(&mut rng) == LossTask::Mlm));

        assert!(TaskSampler::new(&BTreeMap::new()).is_err());
    }

    #[test]
    fn test_accumulation_must_divide_world_size() {
        let dir = tempfile::tempdir().unwrap();
        let replica = DistributedContext::local_group(2).remove(0);
        let config = TrainerConfig { gradient_accumulation_steps: 3, ..base_config(dir.path()) };
        assert!(trainer(config, replica).is_err());

        let replica = DistributedContext::local_group(2).remove(0);
        let config = TrainerConfig { gradient_accumulation_steps: 4, ..base_config(dir.path()) };
        assert_eq!(trainer(config, replica).unwrap().accumulation_steps(), 2);
    }

    #[test]
    fn test_float16_on_cpu_trains_in_float32_without_scaling() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainerConfig { dtype: Precision::Float16, ..base_config(dir.path()) };
        let t = trainer(config, DistributedContext::single_process()).unwrap();
        assert_eq!(t.precision().effective, Precision::Float32);
        assert_eq!(t.loss_scale(), 1.0);
    }

    #[test]
    fn test_train_step_updates_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = trainer(base_config(dir.path()), DistributedContext::single_process()).unwrap();
        let before = t.model().transformer.token_embedding_weight().into_data();

        let outcome = t.train_step(1e-2).unwrap();
        assert!(outcome.loss.is_finite() && outcome.loss > 0.0);
        assert!(!outcome.skipped);
        assert!(outcome.grad_norm.is_some());

        let after = t.model().transformer.token_embedding_weight().into_data();
        assert_ne!(before, after);
    }

    #[test]
    fn test_every_task_can_be_trained() {
        let dir = tempfile::tempdir().unwrap();
        for task in LossTask::ALL {
            let config = TrainerConfig {
                task_probabilities: BTreeMap::from([(task, 1.0)]),
                gradient_accumulation_steps: 2,
                ..base_config(dir.path())
            };
            let mut t = trainer(config, DistributedContext::single_process()).unwrap();
            let outcome = t.train_step(1e-3).unwrap();
            assert!(outcome.loss.is_finite(), "{task} loss is not finite");
        }
    }

    #[test]
    fn test_estimate_loss_reports_both_splits() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = trainer(base_config(dir.path()), DistributedContext::single_process()).unwrap();
        let report = t.estimate_loss().unwrap();
        assert!(report.train_loss.is_finite());
        assert!(report.val_loss.is_finite());
        assert!((0.0..=1.0).contains(&report.valid_fraction));
    }

    #[test]
    fn test_prefix_pooling_trains_and_evaluates() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = tokenizer().with_start_token(true);
        let model = model_config(tokenizer.vocab_size())
            .with_pooling(Pooling::Prefix)
            .init(&Default::default())
            .unwrap();
        let mut t = trainer_with(base_config(dir.path()), model, tokenizer, DistributedContext::single_process())
            .unwrap();

        assert!(t.train_step(1e-2).unwrap().loss.is_finite());
        let report = t.estimate_loss().unwrap();
        assert!(report.train_loss.is_finite());
        assert!(report.val_loss.is_finite());
        assert!((0.0..=1.0).contains(&report.valid_fraction));
    }

    #[test]
    fn test_prefix_pooling_needs_a_two_token_generation_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = tokenizer();
        let model = model_config(tokenizer.vocab_size())
            .with_pooling(Pooling::Prefix)
            .init(&Default::default())
            .unwrap();
        let err = trainer_with(base_config(dir.path()), model, tokenizer, DistributedContext::single_process())
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("prefix"));
    }

    #[test]
    fn test_train_runs_past_max_iters_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = trainer(base_config(dir.path()), DistributedContext::single_process()).unwrap();
        let summary = t.train().unwrap();

        assert_eq!(summary.iterations, 4);
        assert!(summary.last_loss.is_some());
        // Evaluated at iters 0 and 2, saved only at 2
        let csv = fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(dir.path().join("model.mpk").exists());
        let manager = CheckpointManager::open(dir.path()).unwrap();
        assert_eq!(manager.load_state().unwrap().iter_num, 2);
    }

    #[test]
    fn test_eval_only_stops_after_first_eval() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainerConfig { eval_only: true, ..base_config(dir.path()) };
        let mut t = trainer(config, DistributedContext::single_process()).unwrap();
        let summary = t.train().unwrap();

        assert_eq!(summary.iterations, 0);
        assert!(summary.last_loss.is_none());
        assert!(!dir.path().join("model.mpk").exists());
        let csv = fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        assert_eq!(csv.lines().count(), 2);
    }

    #[test]
    fn test_resume_restores_iteration_and_best_loss() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = tokenizer();
        let config_json = JointformerConfig::new(tokenizer.vocab_size(), MAX_LEN)
            .with_embedding_dim(8)
            .with_embedding_hidden_dim(16)
            .with_num_layers(1)
            .with_num_heads(2)
            .with_prediction_hidden_dim(4)
            .with_num_prediction_tasks(2)
            .with_num_physchem_tasks(2)
            .with_attention_dropout(0.0)
            .with_feed_forward_dropout(0.0);
        CheckpointManager::new(dir.path()).unwrap().save_model_config(&config_json).unwrap();

        let mut first = trainer(base_config(dir.path()), DistributedContext::single_process()).unwrap();
        first.train().unwrap();
        let saved = CheckpointManager::open(dir.path()).unwrap().load_state().unwrap();

        let config = TrainerConfig { init_from: InitFrom::Resume, ..base_config(dir.path()) };
        let resumed = trainer(config, DistributedContext::single_process()).unwrap();
        assert_eq!(resumed.state(), saved);
    }

    #[test]
    fn test_replicas_stay_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let initial = model(tokenizer().vocab_size());
        let tokenizer = Arc::new(tokenizer());
        let dataset: SharedDataset = Arc::new(SmilesDataset::new(molecules()));
        let config = TrainerConfig { gradient_accumulation_steps: 2, ..base_config(dir.path()) };

        let weights: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = DistributedContext::local_group(2)
                .into_iter()
                .map(|dist| {
                    let model = initial.clone().fork(&Default::default());
                    let (config, dataset, tokenizer) = (config.clone(), dataset.clone(), tokenizer.clone());
                    scope.spawn(move || {
                        let mut t: TestTrainer = Trainer::new(
                            config,
                            model,
                            dataset.clone(),
                            dataset,
                            tokenizer,
                            Arc::new(SmilesGrammar::new()),
                            dist,
                            Default::default(),
                        )
                        .unwrap();
                        t.train_step(1e-2).unwrap();
                        t.model()
                            .transformer
                            .token_embedding_weight()
                            .into_data()
                            .to_vec::<f32>()
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Both replicas applied the same averaged gradients to the same weights
        assert_eq!(weights[0], weights[1]);
    }
}
