// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Records one CSV row per evaluation of the training loop.
//
//   iter,train_loss,val_loss,valid_fraction,lr
//   0,3.912004,3.910877,0.000000,0.000000
//   2000,1.102553,1.154310,0.412500,0.000600
//
// valid_fraction is the share of molecules generated during the
// evaluation that the validity checker accepts. A NaN loss is
// written as "NaN" so the file still loads in a spreadsheet.
//
// Output file: <out_dir>/metrics.csv, appended across resumed runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

const HEADER: &str = "iter,train_loss,val_loss,valid_fraction,lr";

/// One evaluation of the running model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub iter:           usize,
    pub train_loss:     f64,
    pub val_loss:       f64,
    pub valid_fraction: f64,
    pub lr:             f64,
}

impl EvalMetrics {
    /// Strictly lower validation loss than `best_val_loss`
    pub fn is_improvement(&self, best_val_loss: f64) -> bool {
        self.val_loss < best_val_loss
    }
}

pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the header only if the file doesn't exist yet.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)
                .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
            writeln!(f, "{HEADER}")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EvalMetrics) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;

        writeln!(
            f,
            "{},{:.6},{:.6},{:.6},{:.6}",
            m.iter, m.train_loss, m.val_loss, m.valid_fraction, m.lr,
        )?;

        tracing::debug!("Logged eval at iter {}: val_loss={:.4}", m.iter, m.val_loss);
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(iter: usize, val_loss: f64) -> EvalMetrics {
        EvalMetrics { iter, train_loss: 2.0, val_loss, valid_fraction: 0.25, lr: 6e-4 }
    }

    #[test]
    fn test_is_improvement() {
        assert!(metrics(10, 2.3).is_improvement(3.0));
        assert!(!metrics(10, 2.3).is_improvement(2.3));
        assert!(!metrics(10, f64::NAN).is_improvement(3.0));
    }

    #[test]
    fn test_rows_are_appended_after_header() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log(&metrics(0, 3.5)).unwrap();
        logger.log(&metrics(2000, 1.25)).unwrap();

        // A second logger on the same directory keeps the existing rows
        let again = MetricsLogger::new(dir.path()).unwrap();
        let text = fs::read_to_string(again.csv_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[2], "2000,2.000000,1.250000,0.250000,0.000600");
    }
}
