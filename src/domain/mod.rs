// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types and traits that name the core concepts of
// the system. No Burn types live here and nothing touches the
// filesystem.
//
//   task.rs       — the closed task-tag enums (model, loss,
//                   attention) and their string parsing
//   molecule.rs   — one SMILES string with its property vector
//   traits.rs     — collaborator seams (molecule sources,
//                   chemistry validity checking)
//   chemistry.rs  — structural SMILES grammar checker and
//                   canonical-list helpers
//
// Reference: Rust Book §5 (Structs), §6 (Enums), §10 (Traits)

/// Task tags and their parsing
pub mod task;

/// A molecule record loaded from disk
pub mod molecule;

/// Core abstractions implemented by other layers
pub mod traits;

/// SMILES validity checking
pub mod chemistry;
