// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// Workflow coordination only: each use case wires the data,
// infra and ml layers together for one command. No tensor code
// and no printing here (printing is Layer 1).
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// Run configuration file (data, model and trainer sections)
pub mod config;

// The training workflow
pub mod train_use_case;

// Sampling molecules from a trained checkpoint
pub mod generate_use_case;

// SMILES to molecule embeddings with a trained checkpoint
pub mod encode_use_case;
