// ============================================================
// Layer 4 — Task Tokenizer
// ============================================================
// Turns molecules into task-conditioned model inputs.
//
// Every sequence is laid out the same way, only the leading task
// token changes:
//
//   [task] tok tok tok ... [SEP] [PAD] [PAD] ...   (max_molecule_length)
//
// With the start token enabled (models using prefix extraction,
// whose LM view skips position 0) a [BOS] follows the task token
// and generation is seeded with [GENERATE] [BOS]:
//
//   [task] [BOS] tok tok ... [SEP] [PAD] ...
//
//   task         token           labels / target
//   ───────────  ──────────────  ─────────────────────────────────
//   lm           [GENERATE]      input ids, padding → IGNORE_INDEX
//   mlm          [RECONSTRUCT]   original id at corrupted positions
//   prediction   [PREDICT]       property vector
//   physchem     [PREDICT]       property vector
//
// MLM corruption (BERT recipe): each SMILES token is selected with
// probability `mlm_probability`; a selected token becomes [MASK]
// 80% of the time, a random non-special token 10% of the time and
// stays unchanged otherwise.
//
// Reference: Devlin et al. (2019) BERT, §3.1

use burn::{
    data::dataset::Dataset,
    prelude::*,
    tensor::TensorData,
};
use rand::Rng;
use std::ops::Range;
use thiserror::Error;
use tokenizers::Tokenizer;

use crate::domain::chemistry::validity_fraction;
use crate::domain::molecule::Molecule;
use crate::domain::task::LossTask;
use crate::domain::traits::ValidityChecker;
use crate::ml::loss::IGNORE_INDEX;
use crate::ml::model::LossTarget;

pub const PAD_TOKEN:         &str = "[PAD]";
pub const UNK_TOKEN:         &str = "[UNK]";
pub const SEP_TOKEN:         &str = "[SEP]";
pub const MASK_TOKEN:        &str = "[MASK]";
pub const GENERATE_TOKEN:    &str = "[GENERATE]";
pub const PREDICT_TOKEN:     &str = "[PREDICT]";
pub const RECONSTRUCT_TOKEN: &str = "[RECONSTRUCT]";
pub const BOS_TOKEN:         &str = "[BOS]";

/// Special tokens in id order; ids 0..8 are reserved for them.
pub const SPECIAL_TOKENS: [&str; 8] = [
    PAD_TOKEN,
    UNK_TOKEN,
    SEP_TOKEN,
    MASK_TOKEN,
    GENERATE_TOKEN,
    PREDICT_TOKEN,
    RECONSTRUCT_TOKEN,
    BOS_TOKEN,
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenizerError {
    #[error("tokenizer vocabulary has no `{0}` token")]
    MissingSpecialToken(&'static str),

    #[error("max_molecule_length must be at least 3, got {0}")]
    TooShort(usize),

    #[error("cannot encode `{smiles}`: {reason}")]
    Encode { smiles: String, reason: String },

    #[error("cannot sample a batch from an empty dataset")]
    EmptyDataset,

    #[error("{task} batch needs property targets but molecule `{smiles}` has {got} (expected {expected})")]
    Properties { task: LossTask, smiles: String, expected: usize, got: usize },
}

// ─── ModelInputs ──────────────────────────────────────────────────────────────
/// One tokenized batch, ready for `Jointformer::get_loss`.
#[derive(Debug, Clone)]
pub struct ModelInputs<B: Backend> {
    pub task:           LossTask,
    /// [batch, max_molecule_length]
    pub input_ids:      Tensor<B, 2, Int>,
    /// [batch, max_molecule_length], 1 = real token
    pub attention_mask: Tensor<B, 2, Int>,
    /// Token labels for lm / mlm
    pub labels:         Option<Tensor<B, 2, Int>>,
    /// Property targets for prediction / physchem
    pub target:         Option<Tensor<B, 2>>,
    /// True at the [SEP] position of every row
    pub eos_mask:       Option<Tensor<B, 2, Bool>>,
}

impl<B: Backend> ModelInputs<B> {
    /// Split into the arguments of `get_loss`.
    pub fn into_loss_args(self) -> (Tensor<B, 2, Int>, Tensor<B, 2, Int>, LossTarget<B>) {
        let target = match self.task {
            LossTask::Lm         => LossTarget::Lm { labels: self.labels },
            LossTask::Mlm        => LossTarget::Mlm { labels: self.labels },
            LossTask::Prediction => LossTarget::Prediction { properties: self.target },
            LossTask::Physchem   => LossTarget::Physchem { properties: self.target },
        };
        (self.input_ids, self.attention_mask, target)
    }
}

/// Host-side batch, before upload. Rows are `width` long.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    pub task:           LossTask,
    pub width:          usize,
    pub input_ids:      Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels:         Option<Vec<i64>>,
    pub target:         Option<(Vec<f32>, usize)>,
    pub eos_positions:  Vec<usize>,
}

impl EncodedBatch {
    pub fn rows(&self) -> usize {
        if self.width == 0 { 0 } else { self.input_ids.len() / self.width }
    }

    pub fn row(&self, i: usize) -> &[u32] {
        &self.input_ids[i * self.width..(i + 1) * self.width]
    }

    pub fn into_tensors<B: Backend>(self, device: &B::Device) -> ModelInputs<B> {
        let shape = [self.rows(), self.width];
        let int = |values: Vec<i64>| Tensor::<B, 2, Int>::from_data(TensorData::new(values, shape), device);

        let input_ids = int(self.input_ids.iter().map(|&t| t as i64).collect());
        let attention_mask = int(self.attention_mask.iter().map(|&m| m as i64).collect());
        let labels = self.labels.map(int);
        let target = self.target.map(|(values, n)| {
            Tensor::<B, 2>::from_data(TensorData::new(values, [shape[0], n]), device)
        });

        let mut eos = vec![false; shape[0] * shape[1]];
        for (row, &pos) in self.eos_positions.iter().enumerate() {
            eos[row * self.width + pos] = true;
        }
        let eos_mask = Tensor::<B, 2, Bool>::from_data(TensorData::new(eos, shape), device);

        ModelInputs {
            task: self.task,
            input_ids,
            attention_mask,
            labels,
            target,
            eos_mask: Some(eos_mask),
        }
    }
}

// ─── TaskTokenizer ────────────────────────────────────────────────────────────
/// Tokenizer collaborator used by the trainer and by generation.
pub trait TaskTokenizer {
    /// Sample `batch_size` molecules at random and tokenize them for `task`.
    fn get_inputs<B, D, R>(
        &self,
        dataset:    &D,
        task:       LossTask,
        batch_size: usize,
        device:     &B::Device,
        rng:        &mut R,
    ) -> Result<ModelInputs<B>, TokenizerError>
    where
        B: Backend,
        D: Dataset<Molecule> + ?Sized,
        R: Rng + ?Sized;

    fn generate_token_id(&self) -> u32;
    fn sep_token_id(&self) -> u32;
    fn pad_token_id(&self) -> u32;
    fn max_molecule_length(&self) -> usize;

    /// Tokens that seed unconditional generation.
    fn generation_prefix(&self) -> Vec<u32> {
        vec![self.generate_token_id()]
    }

    /// SMILES for one generated sequence, cut at the first end token.
    fn decode(&self, ids: &[u32]) -> String;

    /// Fraction of sequences that decode to a valid molecule; 0.0 when empty.
    fn is_valid_smiles<C>(&self, sequences: &[Vec<u32>], checker: &C) -> f64
    where
        C: ValidityChecker + ?Sized,
    {
        let decoded: Vec<String> = sequences.iter().map(|s| self.decode(s)).collect();
        validity_fraction(checker, &decoded)
    }
}

// ─── SmilesTokenizer ──────────────────────────────────────────────────────────
pub struct SmilesTokenizer {
    tokenizer:           Tokenizer,
    max_molecule_length: usize,
    mlm_probability:     f64,
    pad_id:              u32,
    sep_id:              u32,
    mask_id:             u32,
    generate_id:         u32,
    predict_id:          u32,
    reconstruct_id:      u32,
    bos_id:              u32,
    start_token:         bool,
    num_special:         u32,
    vocab_size:          u32,
}

impl SmilesTokenizer {
    pub fn new(tokenizer: Tokenizer, max_molecule_length: usize) -> Result<Self, TokenizerError> {
        if max_molecule_length < 3 {
            return Err(TokenizerError::TooShort(max_molecule_length));
        }
        let id = |token: &'static str| {
            tokenizer
                .token_to_id(token)
                .ok_or(TokenizerError::MissingSpecialToken(token))
        };

        let pad_id = id(PAD_TOKEN)?;
        let sep_id = id(SEP_TOKEN)?;
        let mask_id = id(MASK_TOKEN)?;
        let generate_id = id(GENERATE_TOKEN)?;
        let predict_id = id(PREDICT_TOKEN)?;
        let reconstruct_id = id(RECONSTRUCT_TOKEN)?;
        let bos_id = id(BOS_TOKEN)?;
        id(UNK_TOKEN)?;

        let vocab_size = tokenizer.get_vocab_size(true) as u32;
        Ok(Self {
            tokenizer,
            max_molecule_length,
            mlm_probability: 0.15,
            pad_id,
            sep_id,
            mask_id,
            generate_id,
            predict_id,
            reconstruct_id,
            bos_id,
            start_token: false,
            num_special: SPECIAL_TOKENS.len() as u32,
            vocab_size,
        })
    }

    pub fn with_mlm_probability(mut self, probability: f64) -> Self {
        self.mlm_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Put [BOS] after the task token in every row and in the generation prefix.
    pub fn with_start_token(mut self, enabled: bool) -> Self {
        self.start_token = enabled;
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size as usize
    }

    pub fn bos_token_id(&self) -> u32 {
        self.bos_id
    }

    /// Special tokens in front of the SMILES tokens of every row.
    fn leading_tokens(&self, task: LossTask) -> Vec<u32> {
        let mut tokens = vec![self.task_token(task)];
        if self.start_token {
            tokens.push(self.bos_id);
        }
        tokens
    }

    fn task_token(&self, task: LossTask) -> u32 {
        match task {
            LossTask::Lm                               => self.generate_id,
            LossTask::Mlm                              => self.reconstruct_id,
            LossTask::Prediction | LossTask::Physchem  => self.predict_id,
        }
    }

    /// SMILES token ids without any special tokens.
    pub fn encode_smiles(&self, smiles: &str) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self
            .tokenizer
            .encode(smiles, false)
            .map_err(|e| TokenizerError::Encode {
                smiles: smiles.to_string(),
                reason: e.to_string(),
            })?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Leading tokens, SMILES (truncated to fit), [SEP], padding. Also
    /// returns the positions the SMILES tokens occupy; [SEP] sits at `end`.
    fn layout_row(&self, smiles: &str, task: LossTask) -> Result<(Vec<u32>, Range<usize>), TokenizerError> {
        let width = self.max_molecule_length;
        let leading = self.leading_tokens(task);
        let mut tokens = self.encode_smiles(smiles)?;
        tokens.truncate(width.saturating_sub(leading.len() + 1));

        let mut row = Vec::with_capacity(width);
        row.extend_from_slice(&leading);
        row.extend_from_slice(&tokens);
        let span = leading.len()..row.len();
        row.push(self.sep_id);
        row.resize(width, self.pad_id);
        Ok((row, span))
    }

    /// [PREDICT] rows for an embedding pass, without labels or targets.
    pub fn encode_unlabelled(&self, smiles: &[String]) -> Result<EncodedBatch, TokenizerError> {
        let width = self.max_molecule_length;
        let mut batch = EncodedBatch {
            task:           LossTask::Prediction,
            width,
            input_ids:      Vec::with_capacity(smiles.len() * width),
            attention_mask: Vec::with_capacity(smiles.len() * width),
            labels:         None,
            target:         None,
            eos_positions:  Vec::with_capacity(smiles.len()),
        };
        for s in smiles {
            let (row, span) = self.layout_row(s, LossTask::Prediction)?;
            batch.eos_positions.push(span.end);
            batch.attention_mask.extend((0..width).map(|i| u32::from(i <= span.end)));
            batch.input_ids.extend(row);
        }
        Ok(batch)
    }

    /// Tokenize a fixed list of molecules (no sampling of rows).
    pub fn encode_batch<R: Rng + ?Sized>(
        &self,
        molecules: &[Molecule],
        task:      LossTask,
        rng:       &mut R,
    ) -> Result<EncodedBatch, TokenizerError> {
        let width = self.max_molecule_length;
        let mut input_ids = Vec::with_capacity(molecules.len() * width);
        let mut attention_mask = Vec::with_capacity(molecules.len() * width);
        let mut eos_positions = Vec::with_capacity(molecules.len());
        let mut labels = Vec::new();

        for molecule in molecules {
            let (mut row, smiles_span) = self.layout_row(&molecule.smiles, task)?;
            let real = smiles_span.end + 1;
            eos_positions.push(smiles_span.end);

            attention_mask.extend((0..width).map(|i| u32::from(i < real)));

            match task {
                LossTask::Lm => {
                    labels.extend(row.iter().enumerate().map(|(i, &t)| {
                        if i < real { t as i64 } else { IGNORE_INDEX }
                    }));
                }
                LossTask::Mlm => {
                    let mut row_labels = vec![IGNORE_INDEX; width];
                    // Only the SMILES tokens between the leading tokens and [SEP]
                    for pos in smiles_span.clone() {
                        if rng.gen::<f64>() >= self.mlm_probability {
                            continue;
                        }
                        row_labels[pos] = row[pos] as i64;
                        let roll = rng.gen::<f64>();
                        if roll < 0.8 {
                            row[pos] = self.mask_id;
                        } else if roll < 0.9 {
                            row[pos] = self.random_token(rng);
                        }
                    }
                    labels.extend(row_labels);
                }
                LossTask::Prediction | LossTask::Physchem => {}
            }
            input_ids.extend(row);
        }

        let target = if task.uses_labels() {
            None
        } else {
            Some(self.property_targets(molecules, task)?)
        };

        Ok(EncodedBatch {
            task,
            width,
            input_ids,
            attention_mask,
            labels: task.uses_labels().then_some(labels),
            target,
            eos_positions,
        })
    }

    fn random_token<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.vocab_size > self.num_special {
            rng.gen_range(self.num_special..self.vocab_size)
        } else {
            self.mask_id
        }
    }

    fn property_targets(
        &self,
        molecules: &[Molecule],
        task:      LossTask,
    ) -> Result<(Vec<f32>, usize), TokenizerError> {
        let expected = molecules.first().map(|m| m.properties.len()).unwrap_or(0);
        let mut values = Vec::with_capacity(molecules.len() * expected);
        for molecule in molecules {
            let got = molecule.properties.len();
            if got == 0 || got != expected {
                return Err(TokenizerError::Properties {
                    task,
                    smiles: molecule.smiles.clone(),
                    expected,
                    got,
                });
            }
            values.extend_from_slice(&molecule.properties);
        }
        Ok((values, expected))
    }
}

impl TaskTokenizer for SmilesTokenizer {
    fn get_inputs<B, D, R>(
        &self,
        dataset:    &D,
        task:       LossTask,
        batch_size: usize,
        device:     &B::Device,
        rng:        &mut R,
    ) -> Result<ModelInputs<B>, TokenizerError>
    where
        B: Backend,
        D: Dataset<Molecule> + ?Sized,
        R: Rng + ?Sized,
    {
        let len = dataset.len();
        if len == 0 {
            return Err(TokenizerError::EmptyDataset);
        }
        let molecules: Vec<Molecule> = (0..batch_size)
            .filter_map(|_| dataset.get(rng.gen_range(0..len)))
            .collect();
        let batch = self.encode_batch(&molecules, task, rng)?;
        Ok(batch.into_tensors(device))
    }

    fn generate_token_id(&self) -> u32 {
        self.generate_id
    }

    fn sep_token_id(&self) -> u32 {
        self.sep_id
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    fn max_molecule_length(&self) -> usize {
        self.max_molecule_length
    }

    fn generation_prefix(&self) -> Vec<u32> {
        self.leading_tokens(LossTask::Lm)
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .take_while(|&&id| id != self.sep_id)
            .filter(|&&id| id >= self.num_special)
            .filter_map(|&id| self.tokenizer.id_to_token(id))
            .collect()
    }
}
