// ============================================================
// Layer 4 — SMILES File Loader
// ============================================================
// Reads molecules from CSV-like text files:
//
//   smiles,logp,qed            ← optional header (first field "smiles")
//   CCO,-0.31,0.41
//   # comment lines and blank lines are skipped
//   c1ccccc1,1.69,0.44
//
// A line with only a SMILES string yields an unlabelled molecule.
// Within one file every line must carry the same number of
// property columns.
//
// The path may be a single file or a directory; in a directory
// every .csv, .smi and .txt file is read, in name order, and a
// file that fails to parse is skipped with a warning.

use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::domain::molecule::Molecule;
use crate::domain::traits::MoleculeSource;

const EXTENSIONS: [&str; 3] = ["csv", "smi", "txt"];

pub struct SmilesFileLoader {
    path: PathBuf,
}

impl SmilesFileLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl MoleculeSource for SmilesFileLoader {
    fn load_all(&self) -> Result<Vec<Molecule>> {
        if self.path.is_file() {
            let molecules = load_single_file(&self.path)?;
            tracing::info!("Loaded {} molecules from '{}'", molecules.len(), self.path.display());
            return Ok(molecules);
        }

        if !self.path.exists() {
            bail!("Molecule source '{}' does not exist", self.path.display());
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&self.path)
            .with_context(|| format!("Cannot read directory '{}'", self.path.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e))
            })
            .collect();
        files.sort();

        let mut molecules = Vec::new();
        for file in &files {
            match load_single_file(file) {
                Ok(mut loaded) => {
                    tracing::debug!("Loaded: {} ({} molecules)", file.display(), loaded.len());
                    molecules.append(&mut loaded);
                }
                // Log a warning but continue with the other files
                Err(e) => tracing::warn!("Skipping '{}': {:#}", file.display(), e),
            }
        }

        tracing::info!(
            "Loaded {} molecules from {} files in '{}'",
            molecules.len(),
            files.len(),
            self.path.display()
        );
        Ok(molecules)
    }
}

fn load_single_file(path: &Path) -> Result<Vec<Molecule>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Cannot read '{}'", path.display()))?;
    parse_molecules(&text).with_context(|| format!("In '{}'", path.display()))
}

/// Parse the text of one molecule file.
pub fn parse_molecules(text: &str) -> Result<Vec<Molecule>> {
    let mut molecules = Vec::new();
    let mut columns: Option<usize> = None;
    let mut first_record = true;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split(',').map(str::trim);
        let smiles = fields.next().unwrap_or_default();

        if first_record {
            first_record = false;
            if smiles.eq_ignore_ascii_case("smiles") {
                continue;
            }
        }
        if smiles.is_empty() {
            bail!("line {line_no}: empty SMILES field");
        }

        let properties = fields
            .map(|field| {
                field
                    .parse::<f32>()
                    .with_context(|| format!("line {line_no}: `{field}` is not a number"))
            })
            .collect::<Result<Vec<f32>>>()?;

        match columns {
            None => columns = Some(properties.len()),
            Some(expected) if expected != properties.len() => bail!(
                "line {line_no}: expected {expected} property columns, found {}",
                properties.len()
            ),
            Some(_) => {}
        }

        molecules.push(Molecule::new(smiles, properties));
    }

    Ok(molecules)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_comments_and_properties() {
        let text = "smiles,logp,qed\n# a comment\n\nCCO,-0.31,0.41\nc1ccccc1, 1.69 ,0.44\n";
        let molecules = parse_molecules(text).unwrap();
        assert_eq!(molecules.len(), 2);
        assert_eq!(molecules[0], Molecule::new("CCO", vec![-0.31, 0.41]));
        assert_eq!(molecules[1].properties, vec![1.69, 0.44]);
    }

    #[test]
    fn test_smiles_only_file() {
        let molecules = parse_molecules("CCO\nCCN\n").unwrap();
        assert_eq!(molecules.len(), 2);
        assert!(!molecules[0].has_properties());
    }

    #[test]
    fn test_inconsistent_columns_are_rejected() {
        let err = parse_molecules("CCO,1.0\nCCN,1.0,2.0\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));

        let err = parse_molecules("CCO,abc\n").unwrap_err();
        assert!(err.to_string().contains("not a number"));
    }

    #[test]
    fn test_directory_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.smi"), "CCO\nCCN\n").unwrap();
        fs::write(dir.path().join("b.csv"), "CCO,1\nCCN,x\n").unwrap();
        fs::write(dir.path().join("notes.md"), "CCCC\n").unwrap();

        let molecules = SmilesFileLoader::new(dir.path()).load_all().unwrap();
        assert_eq!(molecules.len(), 2);
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SmilesFileLoader::new(dir.path().join("missing.csv")).load_all().is_err());
    }
}
