use burn::data::dataset::Dataset;

use crate::domain::molecule::Molecule;

/// In-memory molecule dataset, sampled at random by the tokenizer.
pub struct SmilesDataset {
    molecules: Vec<Molecule>,
}

impl SmilesDataset {
    pub fn new(molecules: Vec<Molecule>) -> Self { Self { molecules } }

    pub fn molecules(&self) -> &[Molecule] { &self.molecules }

    /// Number of property columns, if every molecule carries the same count.
    pub fn num_properties(&self) -> Option<usize> {
        let first = self.molecules.first()?.properties.len();
        self.molecules
            .iter()
            .all(|m| m.properties.len() == first)
            .then_some(first)
    }
}

impl Dataset<Molecule> for SmilesDataset {
    fn get(&self, index: usize) -> Option<Molecule> {
        self.molecules.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.molecules.len()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_access() {
        let ds = SmilesDataset::new(vec![
            Molecule::new("CCO", vec![1.0]),
            Molecule::new("CCN", vec![2.0]),
        ]);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(1).unwrap().smiles, "CCN");
        assert!(ds.get(2).is_none());
        assert_eq!(ds.num_properties(), Some(1));
    }

    #[test]
    fn test_mixed_property_counts() {
        let ds = SmilesDataset::new(vec![Molecule::new("C", vec![1.0]), Molecule::unlabelled("N")]);
        assert_eq!(ds.num_properties(), None);
        assert_eq!(SmilesDataset::new(Vec::new()).num_properties(), None);
    }
}
