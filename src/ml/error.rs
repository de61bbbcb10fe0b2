//! Model-layer error types

use thiserror::Error;

use crate::domain::task::TaskError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("embedding dim {embed_dim} is not divisible by {num_heads} attention heads")]
    HeadsDoNotDivide { embed_dim: usize, num_heads: usize },

    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("sequence length {seq_len} exceeds the model maximum of {max_seq_len}")]
    SequenceTooLong { seq_len: usize, max_seq_len: usize },

    #[error("sequence length {seq_len} is too short for {strategy} extraction (needs {min})")]
    SequenceTooShort { seq_len: usize, min: usize, strategy: &'static str },

    #[error("{task} forward pass produced no {head} logits")]
    MissingLogits { task: &'static str, head: &'static str },

    #[error("target shape {got:?} does not match logits shape {expected:?}")]
    TargetShape { expected: Vec<usize>, got: Vec<usize> },

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("sampling error: {0}")]
    Sampling(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
