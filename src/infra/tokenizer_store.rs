// ============================================================
// Layer 6 — Tokenizer Store
// ============================================================
// Builds, saves and loads the SMILES tokenizer.
//
// In tokenizers 0.15, train_from_files requires Trainer::Model
// to equal ModelWrapper. We sidestep the trainer: count atoms
// ourselves, then write the tokenizer JSON directly and load it.
//
// The tokenizer is a WordLevel model behind a regex Split
// pre-tokenizer, so every SMILES atom, bond, ring digit and
// bracket expression is one token:
//
//   "CC(=O)[NH3+]"  →  C  C  (  =  O  )  [NH3+]
//
// Ids 0..7 are the special tokens, then atoms by descending
// corpus frequency (ties broken alphabetically so the same
// corpus always yields the same ids).
//
// Reference: Schwaller et al. (2019) Molecular Transformer (SMILES regex)

use anyhow::{Context, Result};
use regex::Regex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokenizers::Tokenizer;

use crate::data::tokenizer::{SPECIAL_TOKENS, UNK_TOKEN};

/// One SMILES token per match.
pub const SMILES_REGEX: &str =
    r"(\[[^\]]+]|Br?|Cl?|N|O|S|P|F|I|b|c|n|o|s|p|\(|\)|\.|=|#|-|\+|\\|/|:|~|@|\?|>|\*|\$|%[0-9]{2}|[0-9])";

pub struct TokenizerStore {
    dir: PathBuf,
}

impl TokenizerStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("tokenizer.json")
    }

    /// Load existing tokenizer or build a new one from the corpus
    pub fn load_or_build(&self, smiles: &[String], max_vocab: Option<usize>) -> Result<Tokenizer> {
        if self.path().exists() {
            tracing::info!("Loading existing tokenizer from '{}'", self.path().display());
            self.load()
        } else {
            tracing::info!("Building SMILES tokenizer from {} molecules", smiles.len());
            self.build_and_save(smiles, max_vocab)
        }
    }

    pub fn load(&self) -> Result<Tokenizer> {
        let path = self.path();
        Tokenizer::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Cannot load tokenizer from '{}': {}", path.display(), e))
    }

    fn build_and_save(&self, smiles: &[String], max_vocab: Option<usize>) -> Result<Tokenizer> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create '{}'", self.dir.display()))?;

        let json = tokenizer_json(smiles, max_vocab)?;
        let path = self.path();
        std::fs::write(&path, serde_json::to_string_pretty(&json)?)
            .with_context(|| format!("Cannot write tokenizer JSON to '{}'", path.display()))?;

        let tokenizer = self.load()?;
        tracing::info!(
            "Tokenizer built with {} tokens, saved to '{}'",
            tokenizer.get_vocab_size(true),
            path.display()
        );
        Ok(tokenizer)
    }
}

/// Build the tokenizer in memory without touching the filesystem.
pub fn build_tokenizer(smiles: &[String], max_vocab: Option<usize>) -> Result<Tokenizer> {
    let json = tokenizer_json(smiles, max_vocab)?;
    Tokenizer::from_str(&json.to_string())
        .map_err(|e| anyhow::anyhow!("Cannot build tokenizer: {e}"))
}

/// Split a SMILES string into atom-level tokens.
pub fn split_smiles(regex: &Regex, smiles: &str) -> Vec<String> {
    regex.find_iter(smiles).map(|m| m.as_str().to_string()).collect()
}

fn tokenizer_json(smiles: &[String], max_vocab: Option<usize>) -> Result<serde_json::Value> {
    let regex = Regex::new(SMILES_REGEX).context("SMILES regex does not compile")?;

    // ── Step 1: Count atom tokens ─────────────────────────────────────────────
    let mut freq: HashMap<String, usize> = HashMap::new();
    for s in smiles {
        for token in split_smiles(&regex, s) {
            *freq.entry(token).or_insert(0) += 1;
        }
    }

    let mut tokens: Vec<(String, usize)> = freq
        .into_iter()
        .filter(|(t, _)| !SPECIAL_TOKENS.contains(&t.as_str()))
        .collect();
    tokens.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    if let Some(max) = max_vocab {
        tokens.truncate(max.saturating_sub(SPECIAL_TOKENS.len()));
    }

    // ── Step 2: Vocabulary, specials first ────────────────────────────────────
    let mut vocab = serde_json::Map::new();
    for (id, token) in SPECIAL_TOKENS.iter().enumerate() {
        vocab.insert(token.to_string(), serde_json::json!(id));
    }
    for (offset, (token, _)) in tokens.iter().enumerate() {
        vocab.insert(token.clone(), serde_json::json!(SPECIAL_TOKENS.len() + offset));
    }

    let added_tokens: Vec<serde_json::Value> = SPECIAL_TOKENS
        .iter()
        .enumerate()
        .map(|(id, token)| {
            serde_json::json!({
                "id": id, "content": token, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        })
        .collect();

    // ── Step 3: HuggingFace tokenizer JSON ────────────────────────────────────
    Ok(serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": {
            "type": "Split",
            "pattern": { "Regex": SMILES_REGEX },
            "behavior": "Isolated",
            "invert": false
        },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": UNK_TOKEN
        }
    }))
}
