// ============================================================
// Layer 5 — Jointformer Model
// ============================================================
// One transformer body, four objectives:
//
//   task          masking          head(s) that fire
//   ────────────  ───────────────  ─────────────────────────────
//   generation    causal           lm_head on the LM view
//   mlm           bidirectional    mlm_head on every position
//   prediction    bidirectional    prediction_head + physchem_head
//   physchem      bidirectional    on the CLS view
//
// Weight tying: with `tie_weights` the lm and mlm heads own no
// parameters and project through the body's token-embedding
// table, which is the single owner of that storage. Saving and
// loading a record therefore keeps the relation by construction.
//
// Reference: Press & Wolf (2017) Using the Output Embedding to
//            Improve Language Models

use burn::{
    module::Ignored,
    optim::{adaptor::OptimizerAdaptor, AdamW, AdamWConfig},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::domain::task::{LossTask, Task};
use crate::ml::error::{ModelError, Result as ModelResult};
use crate::ml::heads::{PredictionHead, PredictionTaskType, VocabHead};
use crate::ml::loss::{
    binary_class_cross_entropy, binary_cross_entropy_with_logits, cross_entropy_with_ignore,
    mse_flat,
};
use crate::ml::output::ModelOutput;
use crate::ml::pooling::{EmbeddingExtraction, Pooling};
use crate::ml::transformer::{Transformer, TransformerConfig};

/// Default width of the physicochemical descriptor head.
pub const DEFAULT_NUM_PHYSCHEM_TASKS: usize = 200;

/// AdamW bound to the model, as returned by `configure_optimizer`.
pub type JointformerOptimizer<B> = OptimizerAdaptor<AdamW, Jointformer<B>, B>;

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally, do NOT add them again or you get conflicting impls.
#[derive(Config, Debug)]
pub struct JointformerConfig {
    pub vocab_size:  usize,
    pub max_seq_len: usize,
    #[config(default = 256)]
    pub embedding_dim: usize,
    #[config(default = 1024)]
    pub embedding_hidden_dim: usize,
    #[config(default = 0.1)]
    pub attention_dropout: f64,
    #[config(default = 0.1)]
    pub feed_forward_dropout: f64,
    #[config(default = 6)]
    pub num_layers: usize,
    #[config(default = 8)]
    pub num_heads: usize,
    #[config(default = true)]
    pub bias: bool,
    #[config(default = 1e-5)]
    pub layer_norm_eps: f64,
    #[config(default = "PredictionTaskType::Regression")]
    pub prediction_task_type: PredictionTaskType,
    #[config(default = 256)]
    pub prediction_hidden_dim: usize,
    #[config(default = 1)]
    pub num_prediction_tasks: usize,
    #[config(default = 200)]
    pub num_physchem_tasks: usize,
    /// LM and MLM heads project through the token-embedding table
    #[config(default = true)]
    pub tie_weights: bool,
    #[config(default = true)]
    pub flash_attention: bool,
    #[config(default = "Pooling::Cls")]
    pub pooling: Pooling,
    #[config(default = false)]
    pub output_layer_embeddings: bool,
}

impl JointformerConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.num_prediction_tasks == 0 {
            return Err(ModelError::InvalidConfig {
                field:  "num_prediction_tasks",
                reason: "must be greater than 0".into(),
            });
        }
        if self.num_physchem_tasks == 0 {
            return Err(ModelError::InvalidConfig {
                field:  "num_physchem_tasks",
                reason: "must be greater than 0".into(),
            });
        }
        if self.num_heads == 0 || self.embedding_dim % self.num_heads != 0 {
            return Err(ModelError::HeadsDoNotDivide {
                embed_dim: self.embedding_dim,
                num_heads: self.num_heads,
            });
        }
        self.pooling.check_seq_len(self.max_seq_len)?;
        Ok(())
    }

    fn transformer_config(&self) -> TransformerConfig {
        TransformerConfig::new(
            self.vocab_size,
            self.max_seq_len,
            self.embedding_dim,
            self.embedding_hidden_dim,
            self.num_layers,
            self.num_heads,
        )
        .with_attention_dropout(self.attention_dropout)
        .with_feed_forward_dropout(self.feed_forward_dropout)
        .with_bias(self.bias)
        .with_layer_norm_eps(self.layer_norm_eps)
        .with_flash_attention(self.flash_attention)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ModelResult<Jointformer<B>> {
        self.validate()?;

        let transformer = self.transformer_config().init(device)?;

        let vocab_head = || {
            if self.tie_weights {
                VocabHead::tied()
            } else {
                VocabHead::untied(self.embedding_dim, self.vocab_size, device)
            }
        };

        Ok(Jointformer {
            transformer,
            lm_head:  vocab_head(),
            mlm_head: vocab_head(),
            physchem_head: PredictionHead::regression(
                self.embedding_dim,
                self.prediction_hidden_dim,
                self.num_physchem_tasks,
                device,
            ),
            prediction_head: PredictionHead::for_task(
                self.prediction_task_type,
                self.embedding_dim,
                self.prediction_hidden_dim,
                self.num_prediction_tasks,
                device,
            ),
            pooling:                 Ignored(self.pooling),
            prediction_task_type:    Ignored(self.prediction_task_type),
            num_prediction_tasks:    self.num_prediction_tasks,
            output_layer_embeddings: self.output_layer_embeddings,
        })
    }
}

#[derive(Module, Debug)]
pub struct Jointformer<B: Backend> {
    pub transformer:             Transformer<B>,
    pub lm_head:                 VocabHead<B>,
    pub mlm_head:                VocabHead<B>,
    pub physchem_head:           PredictionHead<B>,
    pub prediction_head:         PredictionHead<B>,
    pub pooling:                 Ignored<Pooling>,
    pub prediction_task_type:    Ignored<PredictionTaskType>,
    pub num_prediction_tasks:    usize,
    pub output_layer_embeddings: bool,
}

// ─── Loss targets ─────────────────────────────────────────────────────────────
/// What a loss call is computed against. Each variant carries only
/// what its path needs; `None` skips the loss and returns logits only.
#[derive(Debug, Clone)]
pub enum LossTarget<B: Backend> {
    /// Token labels [batch, seq], IGNORE_INDEX where no loss applies
    Lm { labels: Option<Tensor<B, 2, Int>> },
    Mlm { labels: Option<Tensor<B, 2, Int>> },
    /// Property targets [batch, num_prediction_tasks]
    Prediction { properties: Option<Tensor<B, 2>> },
    /// Descriptor targets [batch, num_physchem_tasks]
    Physchem { properties: Option<Tensor<B, 2>> },
}

impl<B: Backend> LossTarget<B> {
    pub fn task(&self) -> LossTask {
        match self {
            LossTarget::Lm { .. }         => LossTask::Lm,
            LossTarget::Mlm { .. }        => LossTask::Mlm,
            LossTarget::Prediction { .. } => LossTask::Prediction,
            LossTarget::Physchem { .. }   => LossTask::Physchem,
        }
    }
}

impl<B: Backend> Jointformer<B> {
    /// input_ids: [batch, seq]; attention_mask: [batch, seq], 1 = real token
    pub fn forward(
        &self,
        input_ids:       Tensor<B, 2, Int>,
        task:            Task,
        attention_mask:  Option<Tensor<B, 2, Int>>,
        next_token_only: bool,
    ) -> ModelResult<ModelOutput<B>> {
        let [_, seq_len] = input_ids.dims();
        let pooling = self.pooling.0;
        pooling.check_seq_len(seq_len)?;

        // Generation runs causally and never sees the padding mask
        let is_causal = task.is_causal();
        let key_mask = attention_mask.clone().map(|m| m.greater_elem(0));
        let body_mask = if is_causal { None } else { key_mask.clone() };

        let body = self.transformer.forward(
            input_ids,
            is_causal,
            body_mask,
            self.output_layer_embeddings,
        )?;

        let cls_embeddings = pooling.cls_embeddings(body.embeddings.clone(), key_mask.as_ref());
        let lm_embeddings = pooling.lm_embeddings(body.embeddings.clone(), next_token_only);

        let (logits_generation, logits_physchem, logits_prediction) = if is_causal {
            let logits = self.lm_head.forward(
                lm_embeddings.clone(),
                self.transformer.token_embedding_weight(),
            );
            (Some(logits), None, None)
        } else {
            (
                None,
                Some(self.physchem_head.forward(cls_embeddings.clone())),
                Some(self.prediction_head.forward(cls_embeddings.clone())),
            )
        };

        Ok(ModelOutput {
            attention_mask,
            embeddings: body.embeddings,
            cls_embeddings,
            lm_embeddings,
            logits_generation,
            logits_physchem,
            logits_prediction,
            layer_embeddings: body.layer_embeddings,
            loss: None,
        })
    }

    /// Forward with the prediction task.
    pub fn predict(
        &self,
        input_ids:      Tensor<B, 2, Int>,
        attention_mask: Option<Tensor<B, 2, Int>>,
    ) -> ModelResult<ModelOutput<B>> {
        self.forward(input_ids, Task::Prediction, attention_mask, false)
    }

    /// Pooled molecule embeddings [batch, embed] from a bidirectional pass.
    pub fn encode(
        &self,
        input_ids:      Tensor<B, 2, Int>,
        attention_mask: Option<Tensor<B, 2, Int>>,
    ) -> ModelResult<Tensor<B, 2>> {
        Ok(self.predict(input_ids, attention_mask)?.cls_embeddings)
    }

    /// Forward plus the task loss, routed by the target variant.
    pub fn get_loss(
        &self,
        input_ids:      Tensor<B, 2, Int>,
        attention_mask: Option<Tensor<B, 2, Int>>,
        target:         LossTarget<B>,
    ) -> ModelResult<ModelOutput<B>> {
        match target {
            LossTarget::Lm { labels }              => self.loss_lm(input_ids, attention_mask, labels),
            LossTarget::Mlm { labels }             => self.loss_mlm(input_ids, attention_mask, labels),
            LossTarget::Prediction { properties }  => self.loss_prediction(input_ids, attention_mask, properties),
            LossTarget::Physchem { properties }    => self.loss_physchem(input_ids, attention_mask, properties),
        }
    }

    fn loss_lm(
        &self,
        input_ids:      Tensor<B, 2, Int>,
        attention_mask: Option<Tensor<B, 2, Int>>,
        labels:         Option<Tensor<B, 2, Int>>,
    ) -> ModelResult<ModelOutput<B>> {
        let mut output = self.forward(input_ids, Task::Generation, attention_mask, false)?;
        let Some(labels) = labels else {
            return Ok(output);
        };

        let logits = output
            .logits_generation
            .clone()
            .ok_or(ModelError::MissingLogits { task: "lm", head: "generation" })?;
        let [batch, positions, vocab] = logits.dims();
        let [label_rows, seq_len] = labels.dims();
        if label_rows != batch || seq_len < positions {
            return Err(ModelError::TargetShape {
                expected: vec![batch, positions],
                got:      vec![label_rows, seq_len],
            });
        }
        if positions < 2 {
            return Err(ModelError::SequenceTooShort {
                seq_len,
                min:      seq_len - positions + 2,
                strategy: self.pooling.0.as_str(),
            });
        }

        // The LM view covers the last `positions` tokens. Logit p predicts
        // the token after absolute position (offset + p).
        let offset = seq_len - positions;
        let steps = positions - 1;
        let logits = logits
            .slice([0..batch, 0..steps, 0..vocab])
            .reshape([batch * steps, vocab]);
        let targets = labels
            .slice([0..batch, offset + 1..seq_len])
            .reshape([batch * steps]);

        output.loss = Some(cross_entropy_with_ignore(logits, targets));
        Ok(output)
    }

    fn loss_mlm(
        &self,
        input_ids:      Tensor<B, 2, Int>,
        attention_mask: Option<Tensor<B, 2, Int>>,
        labels:         Option<Tensor<B, 2, Int>>,
    ) -> ModelResult<ModelOutput<B>> {
        let mut output = self.forward(input_ids, Task::MaskedLm, attention_mask, false)?;
        let logits = self.mlm_head.forward(
            output.embeddings.clone(),
            self.transformer.token_embedding_weight(),
        );
        output.logits_generation = Some(logits.clone());

        if let Some(labels) = labels {
            let [batch, seq, vocab] = logits.dims();
            if labels.dims() != [batch, seq] {
                return Err(ModelError::TargetShape {
                    expected: vec![batch, seq],
                    got:      labels.dims().to_vec(),
                });
            }
            output.loss = Some(cross_entropy_with_ignore(
                logits.reshape([batch * seq, vocab]),
                labels.reshape([batch * seq]),
            ));
        }
        Ok(output)
    }

    fn loss_physchem(
        &self,
        input_ids:      Tensor<B, 2, Int>,
        attention_mask: Option<Tensor<B, 2, Int>>,
        properties:     Option<Tensor<B, 2>>,
    ) -> ModelResult<ModelOutput<B>> {
        let mut output = self.forward(input_ids, Task::Physchem, attention_mask, false)?;
        if let Some(properties) = properties {
            let logits = output
                .logits_physchem
                .clone()
                .ok_or(ModelError::MissingLogits { task: "physchem", head: "physchem" })?;
            output.loss = Some(mse_flat(logits, properties)?);
        }
        Ok(output)
    }

    fn loss_prediction(
        &self,
        input_ids:      Tensor<B, 2, Int>,
        attention_mask: Option<Tensor<B, 2, Int>>,
        properties:     Option<Tensor<B, 2>>,
    ) -> ModelResult<ModelOutput<B>> {
        let mut output = self.predict(input_ids, attention_mask)?;
        if let Some(properties) = properties {
            let logits = output
                .logits_prediction
                .clone()
                .ok_or(ModelError::MissingLogits { task: "prediction", head: "prediction" })?;

            let loss = match (self.prediction_task_type.0, self.num_prediction_tasks) {
                (PredictionTaskType::Regression, _)     => mse_flat(logits, properties)?,
                (PredictionTaskType::Classification, 1) => binary_class_cross_entropy(logits, properties)?,
                (PredictionTaskType::Classification, _) => binary_cross_entropy_with_logits(logits, properties)?,
            };
            output.loss = Some(loss);
        }
        Ok(output)
    }

    /// LM projection weight in embedding layout [vocab, embed].
    pub fn lm_head_weight(&self) -> Tensor<B, 2> {
        self.lm_head.weight(self.transformer.token_embedding_weight())
    }

    pub fn mlm_head_weight(&self) -> Tensor<B, 2> {
        self.mlm_head.weight(self.transformer.token_embedding_weight())
    }

    /// True when both vocabulary heads project through the embedding table.
    pub fn is_tied(&self) -> bool {
        self.lm_head.is_tied() && self.mlm_head.is_tied()
    }

    pub fn max_seq_len(&self) -> usize {
        self.transformer.max_seq_len
    }

    pub fn vocab_size(&self) -> usize {
        self.transformer.vocab_size()
    }

    pub fn embedding_dim(&self) -> usize {
        self.transformer.embedding_dim()
    }

    pub fn pooling(&self) -> Pooling {
        self.pooling.0
    }
}

impl<B: AutodiffBackend> Jointformer<B> {
    /// AdamW over every parameter of this model.
    pub fn configure_optimizer(
        &self,
        weight_decay: f64,
        beta1:        f64,
        beta2:        f64,
    ) -> JointformerOptimizer<B> {
        AdamWConfig::new()
            .with_weight_decay(weight_decay as f32)
            .with_beta_1(beta1 as f32)
            .with_beta_2(beta2 as f32)
            .init()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    use crate::ml::loss::IGNORE_INDEX;

    type TestBackend = NdArray;

    pub(crate) fn tiny_config() -> JointformerConfig {
        JointformerConfig::new(10, 16)
            .with_embedding_dim(8)
            .with_embedding_hidden_dim(16)
            .with_num_layers(2)
            .with_num_heads(2)
            .with_prediction_hidden_dim(8)
            .with_num_physchem_tasks(3)
            .with_attention_dropout(0.0)
            .with_feed_forward_dropout(0.0)
    }

    fn ids(rows: Vec<Vec<i64>>) -> Tensor<TestBackend, 2, Int> {
        let (b, t) = (rows.len(), rows[0].len());
        let flat: Vec<i64> = rows.into_iter().flatten().collect();
        Tensor::from_data(TensorData::new(flat, [b, t]), &Default::default())
    }

    fn batch() -> Tensor<TestBackend, 2, Int> {
        ids(vec![vec![4, 7, 8, 2], vec![4, 9, 2, 0]])
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem::<f32>()
    }

    #[test]
    fn test_generation_logits_shape() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();

        let full = model.forward(batch(), Task::Generation, None, false).unwrap();
        assert_eq!(full.logits_generation.unwrap().dims(), [2, 4, 10]);

        let next = model.forward(batch(), Task::Generation, None, true).unwrap();
        assert_eq!(next.logits_generation.unwrap().dims(), [2, 1, 10]);
    }

    #[test]
    fn test_only_task_heads_are_populated() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();

        let gen = model.forward(batch(), Task::Generation, None, false).unwrap();
        assert!(gen.logits_generation.is_some());
        assert!(gen.logits_physchem.is_none());
        assert!(gen.logits_prediction.is_none());
        assert!(gen.loss.is_none());

        let phys = model.forward(batch(), Task::Physchem, None, false).unwrap();
        assert!(phys.logits_generation.is_none());
        assert_eq!(phys.logits_physchem.unwrap().dims(), [2, 3]);
        assert_eq!(phys.logits_prediction.unwrap().dims(), [2, 1]);
    }

    #[test]
    fn test_encode_returns_one_row_per_molecule() {
        let device = Default::default();
        let model = tiny_config().with_pooling(Pooling::MaxPooled).init::<TestBackend>(&device).unwrap();
        let mask = ids(vec![vec![1, 1, 1, 1], vec![1, 1, 0, 0]]);

        let embeddings = model.encode(batch(), Some(mask.clone())).unwrap();
        let [rows, dim] = embeddings.dims();
        assert_eq!((rows, dim), (2, model.embedding_dim()));

        let cls = model.predict(batch(), Some(mask)).unwrap().cls_embeddings;
        let values = |t: Tensor<TestBackend, 2>| t.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_eq!(values(embeddings), values(cls));
    }

    #[test]
    fn test_loss_routing() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();
        let mask = ids(vec![vec![1, 1, 1, 1], vec![1, 1, 1, 0]]);

        // lm: generation logits only
        let labels = ids(vec![vec![4, 7, 8, 2], vec![4, 9, 2, IGNORE_INDEX]]);
        let lm = model
            .get_loss(batch(), Some(mask.clone()), LossTarget::Lm { labels: Some(labels) })
            .unwrap();
        assert!(lm.logits_generation.is_some());
        assert!(lm.logits_physchem.is_none());
        assert!(lm.logits_prediction.is_none());
        assert!(scalar(lm.loss.unwrap()).is_finite());

        // physchem: physchem logits, no generation logits
        let props = Tensor::<TestBackend, 2>::random([2, 3], Distribution::Default, &device);
        let phys = model
            .get_loss(batch(), Some(mask.clone()), LossTarget::Physchem { properties: Some(props) })
            .unwrap();
        assert!(phys.logits_physchem.is_some());
        assert!(phys.logits_generation.is_none());
        assert!(phys.loss.is_some());

        // mlm: MLM logits are reported through logits_generation
        let mlm_labels = ids(vec![vec![IGNORE_INDEX, 7, IGNORE_INDEX, IGNORE_INDEX], vec![IGNORE_INDEX; 4]]);
        let mlm = model
            .get_loss(batch(), Some(mask), LossTarget::Mlm { labels: Some(mlm_labels) })
            .unwrap();
        assert_eq!(mlm.logits_generation.unwrap().dims(), [2, 4, 10]);
        assert!(mlm.loss.is_some());
    }

    #[test]
    fn test_missing_labels_skip_the_loss() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();
        let out = model.get_loss(batch(), None, LossTarget::Lm { labels: None }).unwrap();
        assert!(out.loss.is_none());
        let out = model.get_loss(batch(), None, LossTarget::Prediction { properties: None }).unwrap();
        assert!(out.loss.is_none());
    }

    #[test]
    fn test_prediction_losses_per_task_type() {
        let device = Default::default();

        let binary = tiny_config()
            .with_prediction_task_type(PredictionTaskType::Classification)
            .init::<TestBackend>(&device)
            .unwrap();
        let classes = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![0.0f32, 1.0], [2, 1]), &device);
        let out = binary
            .get_loss(batch(), None, LossTarget::Prediction { properties: Some(classes) })
            .unwrap();
        assert_eq!(out.logits_prediction.unwrap().dims(), [2, 2]);
        assert!(scalar(out.loss.unwrap()) > 0.0);

        let multi = tiny_config()
            .with_prediction_task_type(PredictionTaskType::Classification)
            .with_num_prediction_tasks(3)
            .init::<TestBackend>(&device)
            .unwrap();
        let labels = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 1.0, 0.0, 0.0, 1.0], [2, 3]),
            &device,
        );
        let out = multi
            .get_loss(batch(), None, LossTarget::Prediction { properties: Some(labels) })
            .unwrap();
        assert!(scalar(out.loss.unwrap()) > 0.0);
    }

    #[test]
    fn test_prefix_strategy_aligns_lm_labels() {
        let device = Default::default();
        let model = tiny_config()
            .with_pooling(Pooling::Prefix)
            .init::<TestBackend>(&device)
            .unwrap();
        let out = model.forward(batch(), Task::Generation, None, false).unwrap();
        assert_eq!(out.logits_generation.unwrap().dims(), [2, 3, 10]);

        let labels = batch();
        let out = model
            .get_loss(batch(), None, LossTarget::Lm { labels: Some(labels) })
            .unwrap();
        assert!(scalar(out.loss.unwrap()).is_finite());
    }

    #[test]
    fn test_config_validation() {
        let device: <TestBackend as Backend>::Device = Default::default();
        let err = tiny_config()
            .with_num_prediction_tasks(0)
            .init::<TestBackend>(&device)
            .err()
            .unwrap();
        assert!(matches!(err, ModelError::InvalidConfig { field: "num_prediction_tasks", .. }));

        let err = tiny_config().with_num_heads(3).init::<TestBackend>(&device).err().unwrap();
        assert_eq!(err, ModelError::HeadsDoNotDivide { embed_dim: 8, num_heads: 3 });
    }

    #[test]
    fn test_tied_heads_share_the_embedding_table() {
        let device = Default::default();
        let tied = tiny_config().init::<TestBackend>(&device).unwrap();
        assert!(tied.is_tied());
        let emb = tied.transformer.token_embedding_weight().into_data();
        assert_eq!(tied.lm_head_weight().into_data(), emb);
        assert_eq!(tied.mlm_head_weight().into_data(), emb);

        let untied = tiny_config().with_tie_weights(false).init::<TestBackend>(&device).unwrap();
        assert!(!untied.is_tied());
        // Tying removes two [vocab, embed] matrices from the parameter count
        assert_eq!(untied.num_params() - tied.num_params(), 2 * 10 * 8);
    }

    #[test]
    fn test_sequence_too_long_is_rejected() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device).unwrap();
        let long = ids(vec![(0..17).map(|i| i % 10).collect()]);
        let err = model.forward(long, Task::Generation, None, false).err().unwrap();
        assert_eq!(err, ModelError::SequenceTooLong { seq_len: 17, max_seq_len: 16 });
    }
}
