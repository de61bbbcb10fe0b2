// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction, parsed with clap.
// All work is delegated to Layer 2 (application).
//
//   1. `train`       — train on SMILES files described by a run config
//   2. `generate`    — sample molecules from a trained checkpoint
//   3. `encode`      — embed SMILES with a trained checkpoint
//   4. `init-config` — write the default run config as a starting point
//
// Reference: Rust Book §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, EncodeArgs, GenerateArgs, InitConfigArgs, TrainArgs};

use crate::application::config::RunConfig;

#[derive(Parser, Debug)]
#[command(
    name = "jointformer",
    version,
    about = "Train a joint generative/predictive transformer on SMILES, then sample or embed molecules."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Route the subcommand to its use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)      => run_train(args),
            Commands::Generate(args)   => run_generate(args),
            Commands::Encode(args)     => run_encode(args),
            Commands::InitConfig(args) => run_init_config(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let config = args.into_run_config()?;
    tracing::info!(
        "Training on '{}', writing to '{}'",
        config.data.train_path,
        config.trainer.out_dir
    );

    let out_dir = config.trainer.out_dir.clone();
    let summary = TrainUseCase::new(config).execute()?;

    println!(
        "Training complete: {} iterations, best val loss {:.4}. Checkpoint in '{}'.",
        summary.iterations, summary.best_val_loss, out_dir
    );
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    use crate::application::generate_use_case::GenerateUseCase;

    let report = GenerateUseCase::new(args.into_request()).execute()?;
    for smiles in &report.smiles {
        println!("{smiles}");
    }
    println!(
        "\n{} samples, {:.1}% valid, {} unique valid molecules",
        report.smiles.len(),
        report.valid_fraction * 100.0,
        report.unique_valid.len()
    );
    Ok(())
}

fn run_encode(args: EncodeArgs) -> Result<()> {
    use crate::application::encode_use_case::EncodeUseCase;

    let output = args.output.clone();
    let embeddings = EncodeUseCase::new(args.into_request()?).execute()?;

    match output {
        Some(path) => {
            embeddings.write_csv(&path)?;
            println!(
                "Wrote {} embeddings ({} values each) to '{}'",
                embeddings.rows.len(),
                embeddings.dim,
                path.display()
            );
        }
        None => {
            for (smiles, row) in embeddings.smiles.iter().zip(&embeddings.rows) {
                let values: Vec<String> = row.iter().map(|v| format!("{v:.4}")).collect();
                println!("{smiles}\t{}", values.join(" "));
            }
        }
    }
    Ok(())
}

fn run_init_config(args: InitConfigArgs) -> Result<()> {
    RunConfig::default().save(&args.output)?;
    println!("Wrote default run config to '{}'", args.output);
    Ok(())
}
