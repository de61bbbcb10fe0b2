// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// `train` reads a run config file and lets a few common fields
// be overridden from the command line; everything else lives in
// the file (`jointformer init-config` writes a full default one).
//
// Reference: Rust Book §12 (Building a CLI Program)

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::config::{InitFrom, RunConfig};
use crate::application::encode_use_case::EncodeRequest;
use crate::application::generate_use_case::GenerateRequest;
use crate::data::loader::SmilesFileLoader;
use crate::domain::traits::MoleculeSource;
use crate::ml::generation::SamplingConfig;
use crate::ml::precision::Precision;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a model on SMILES files
    Train(TrainArgs),

    /// Sample molecules from a trained checkpoint
    Generate(GenerateArgs),

    /// Embed SMILES with a trained checkpoint
    Encode(EncodeArgs),

    /// Write the default run config to a file
    InitConfig(InitConfigArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Run config JSON; defaults are used for anything it leaves out
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// SMILES file or directory (overrides data.train_path)
    #[arg(long)]
    pub train_path: Option<String>,

    /// Checkpoint directory (overrides trainer.out_dir)
    #[arg(long)]
    pub out_dir: Option<String>,

    /// cpu, wgpu, cuda, ... (overrides trainer.device)
    #[arg(long)]
    pub device: Option<String>,

    /// float32, bfloat16 or float16 (overrides trainer.dtype)
    #[arg(long)]
    pub dtype: Option<Precision>,

    #[arg(long)]
    pub max_iters: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Continue from the checkpoint in out_dir
    #[arg(long)]
    pub resume: bool,

    /// Run thread replicas with data-parallel training
    #[arg(long)]
    pub world_size: Option<usize>,
}

impl TrainArgs {
    /// Load the config file (if any) and apply the overrides.
    pub fn into_run_config(self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };

        if let Some(path) = self.train_path {
            config.data.train_path = path;
        }
        let trainer = &mut config.trainer;
        if let Some(out_dir) = self.out_dir {
            trainer.out_dir = out_dir;
        }
        if let Some(device) = self.device {
            trainer.device = device;
        }
        if let Some(dtype) = self.dtype {
            trainer.dtype = dtype;
        }
        if let Some(max_iters) = self.max_iters {
            trainer.max_iters = max_iters;
        }
        if let Some(batch_size) = self.batch_size {
            trainer.batch_size = batch_size;
        }
        if self.resume {
            trainer.init_from = InitFrom::Resume;
        }
        if let Some(world_size) = self.world_size {
            trainer.ddp_enabled = world_size > 1;
            trainer.ddp_world_size = world_size;
        }

        config.trainer.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Directory written by `train`
    #[arg(long, default_value = "out")]
    pub checkpoint_dir: PathBuf,

    #[arg(long, default_value_t = 10)]
    pub num_samples: usize,

    /// Samples drawn per forward batch
    #[arg(long, default_value_t = 10)]
    pub batch_size: usize,

    /// Softmax temperature, must be > 0
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f64,

    /// Sample only from the k most likely tokens
    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long, default_value_t = 1337)]
    pub seed: u64,

    #[arg(long, default_value = "cpu")]
    pub device: String,
}

impl GenerateArgs {
    pub fn into_request(self) -> GenerateRequest {
        GenerateRequest {
            checkpoint_dir: self.checkpoint_dir,
            num_samples:    self.num_samples,
            batch_size:     self.batch_size,
            sampling:       SamplingConfig::new(self.temperature, self.top_k),
            seed:           self.seed,
            device:         self.device,
        }
    }
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Directory written by `train`
    #[arg(long, default_value = "out")]
    pub checkpoint_dir: PathBuf,

    /// SMILES file or directory to embed
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// SMILES given directly; may be repeated
    #[arg(long = "smiles")]
    pub smiles: Vec<String>,

    /// Write `smiles,e0,e1,...` rows here instead of printing them
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, default_value = "cpu")]
    pub device: String,
}

impl EncodeArgs {
    /// Collect the molecules from `--input` and `--smiles`, file first.
    pub fn into_request(self) -> Result<EncodeRequest> {
        let mut smiles = match &self.input {
            Some(path) => SmilesFileLoader::new(path)
                .load_all()?
                .into_iter()
                .map(|m| m.smiles)
                .collect(),
            None => Vec::new(),
        };
        smiles.extend(self.smiles);
        if smiles.is_empty() {
            bail!("Nothing to encode: pass --input or --smiles");
        }

        Ok(EncodeRequest {
            checkpoint_dir: self.checkpoint_dir,
            smiles,
            batch_size:     self.batch_size,
            device:         self.device,
        })
    }
}

#[derive(Args, Debug)]
pub struct InitConfigArgs {
    #[arg(long, default_value = "run.json")]
    pub output: String,
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::cli::Cli;

    #[test]
    fn test_train_overrides_apply_on_top_of_defaults() {
        let cli = Cli::try_parse_from([
            "jointformer", "train", "--out-dir", "runs/a", "--dtype", "float16",
            "--max-iters", "10", "--resume", "--world-size", "2",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else { panic!("expected train") };

        let config = args.into_run_config().unwrap();
        assert_eq!(config.trainer.out_dir, "runs/a");
        assert_eq!(config.trainer.dtype, Precision::Float16);
        assert_eq!(config.trainer.max_iters, 10);
        assert_eq!(config.trainer.init_from, InitFrom::Resume);
        assert_eq!(config.trainer.world_size(), 2);
        assert_eq!(config.data, RunConfig::default().data);
    }

    #[test]
    fn test_unknown_dtype_is_rejected() {
        assert!(Cli::try_parse_from(["jointformer", "train", "--dtype", "float8"]).is_err());
    }

    #[test]
    fn test_encode_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.smi");
        std::fs::write(&input, "CCO\nc1ccccc1\n").unwrap();

        let cli = Cli::try_parse_from([
            "jointformer", "encode", "--input", input.to_str().unwrap(), "--smiles", "CCN",
            "--batch-size", "4",
        ])
        .unwrap();
        let Commands::Encode(args) = cli.command else { panic!("expected encode") };
        assert!(args.output.is_none());

        let request = args.into_request().unwrap();
        assert_eq!(request.smiles, vec!["CCO", "c1ccccc1", "CCN"]);
        assert_eq!(request.batch_size, 4);
        assert_eq!(request.checkpoint_dir, PathBuf::from("out"));

        let cli = Cli::try_parse_from(["jointformer", "encode"]).unwrap();
        let Commands::Encode(args) = cli.command else { panic!("expected encode") };
        assert!(args.into_request().is_err());
    }

    #[test]
    fn test_generate_arguments() {
        let cli = Cli::try_parse_from([
            "jointformer", "generate", "--checkpoint-dir", "ckpt", "--num-samples", "5",
            "--temperature", "0.8", "--top-k", "3",
        ])
        .unwrap();
        let Commands::Generate(args) = cli.command else { panic!("expected generate") };

        let request = args.into_request();
        assert_eq!(request.checkpoint_dir, PathBuf::from("ckpt"));
        assert_eq!(request.num_samples, 5);
        assert_eq!(request.sampling, SamplingConfig::new(0.8, Some(3)));
    }
}
