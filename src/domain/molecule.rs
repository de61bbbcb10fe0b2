// ============================================================
// Layer 3 — Molecule Domain Type
// ============================================================
// One training example: a SMILES string plus an optional
// vector of numeric properties (regression targets, class
// labels stored as floats, or physicochemical descriptors).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    /// SMILES notation of the molecule
    pub smiles: String,

    /// Property targets in column order; empty when the source
    /// file carries SMILES only
    pub properties: Vec<f32>,
}

impl Molecule {
    pub fn new(smiles: impl Into<String>, properties: Vec<f32>) -> Self {
        Self {
            smiles: smiles.into(),
            properties,
        }
    }

    /// A molecule with no property annotations.
    pub fn unlabelled(smiles: impl Into<String>) -> Self {
        Self::new(smiles, Vec::new())
    }

    pub fn has_properties(&self) -> bool {
        !self.properties.is_empty()
    }
}
