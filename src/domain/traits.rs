// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// Seams where the core meets its collaborators. The training
// loop and the generate command only see these traits, so a
// different molecule source or a full cheminformatics toolkit
// can be dropped in without touching the model code.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;

use crate::domain::molecule::Molecule;

// ─── MoleculeSource ───────────────────────────────────────────────────────────
/// Any component that can load molecules from somewhere.
///
/// Implementations:
///   - SmilesFileLoader → CSV-like SMILES file with property columns
pub trait MoleculeSource {
    /// Load every molecule available from this source.
    fn load_all(&self) -> Result<Vec<Molecule>>;
}

// ─── ValidityChecker ──────────────────────────────────────────────────────────
/// Chemistry validity collaborator.
///
/// Used during evaluation and by the generate command, never
/// inside the gradient path.
///
/// Implementations:
///   - SmilesGrammar → structural SMILES parse (no valence model)
pub trait ValidityChecker {
    /// True if the string describes a valid, non-empty molecule.
    fn is_valid(&self, smiles: &str) -> bool;

    /// Canonical form of a valid molecule, `None` for invalid input.
    fn canonicalize(&self, smiles: &str) -> Option<String>;
}
