// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything the training loop writes to disk:
//
//   checkpoint.rs      — model, optimizer and loop state
//                        (NamedMpkFileRecorder) plus the JSON
//                        configs a later run needs to rebuild
//                        the model.
//
//   tokenizer_store.rs — builds the SMILES vocabulary from the
//                        training molecules on the first run and
//                        reloads it afterwards, so training and
//                        generation share one vocabulary.
//
//   metrics.rs         — one CSV row per evaluation.
//
// Reference: Burn Book §5 (Checkpointing)

/// Model, optimizer and loop-state checkpoints
pub mod checkpoint;

/// SMILES tokenizer building, saving and loading
pub mod tokenizer_store;

/// Evaluation metrics CSV logger
pub mod metrics;
