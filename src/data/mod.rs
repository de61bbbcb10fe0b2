// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything between SMILES files on disk and token tensors:
//
//   .csv / .smi files
//       │
//       ▼
//   SmilesFileLoader   → Vec<Molecule>
//       │
//       ▼
//   split_train_val    → train / validation molecules
//       │
//       ▼
//   SmilesDataset      → burn Dataset<Molecule>
//       │
//       ▼
//   SmilesTokenizer    → random task-conditioned batches
//                        (ModelInputs: ids, mask, labels / targets)
//
// There is no DataLoader here: the trainer draws a fresh random
// batch for every micro-step, so batches are built on demand.

/// Reads molecule files (one file or a directory of them)
pub mod loader;

/// Implements Burn's Dataset trait for molecules
pub mod dataset;

/// Task tokenizer collaborator and its SMILES implementation
pub mod tokenizer;

/// Seeded train/validation split
pub mod splitter;
