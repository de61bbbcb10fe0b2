#![recursion_limit = "256"]
//! Jointformer: one transformer trained jointly on SMILES generation,
//! masked reconstruction and property prediction.
//!
//! Layers, outermost first:
//!
//! | layer | module        | role                                       |
//! |-------|---------------|--------------------------------------------|
//! | 1     | `cli`         | clap commands                              |
//! | 2     | `application` | run config and use cases                   |
//! | 3     | `domain`      | molecules, tasks, collaborator traits      |
//! | 4     | `data`        | SMILES files, datasets, task tokenizer     |
//! | 5     | `ml`          | model, generation, training loop (Burn)    |
//! | 6     | `infra`       | checkpoints, tokenizer store, metrics CSV  |

pub mod cli;
pub mod application;
pub mod domain;
pub mod data;
pub mod ml;
pub mod infra;
