// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All tensor code lives here.
//
//   attention.rs   — hybrid self-attention (causal for lm,
//                    bidirectional with a key mask for mlm)
//   transformer.rs — embedding + pre-norm blocks + final norm
//   heads.rs       — vocabulary heads (tied or untied) and
//                    prediction / physchem heads
//   pooling.rs     — sequence → embedding extraction strategies
//   loss.rs        — cross-entropy with ignore index, MSE, BCE
//   model.rs       — Jointformer: task routing and losses
//   generation.rs  — temperature / top-k sampling loop
//
//   schedule.rs    — cosine learning-rate schedule with warmup
//   precision.rs   — dtype resolution and loss scaling
//   distributed.rs — replica rank/world size and the gradient
//                    all-reduce collective
//   grads.rs       — gradient clipping, unscaling, all-reduce
//   trainer.rs     — the training loop
//
// Reference: Burn Book §3 (Building Blocks), §5 (Training)
//            Vaswani et al. (2017) Attention Is All You Need

/// Error type for model construction and forward passes
pub mod error;

/// Hybrid causal / bidirectional self-attention
pub mod attention;

/// Transformer body
pub mod transformer;

/// Output heads
pub mod heads;

/// Embedding extraction strategies
pub mod pooling;

/// Loss functions
pub mod loss;

/// Forward-pass output bundle
pub mod output;

/// The Jointformer model
pub mod model;

/// Autoregressive sampling
pub mod generation;

pub mod schedule;

pub mod precision;

/// Data-parallel replica context and process groups
pub mod distributed;

/// Whole-model gradient operations
pub mod grads;

/// Training loop with evaluation and checkpointing
pub mod trainer;
