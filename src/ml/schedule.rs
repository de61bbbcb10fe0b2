//! Learning-rate schedules.
//!
//! Cosine decay with linear warmup:
//!
//! ```text
//!   lr(it) = learning_rate · it / warmup                      it <  warmup
//!          = min_lr + ½(1 + cos(π·r)) · (learning_rate − min_lr)   warmup ≤ it < decay
//!            where r = (it − warmup) / (decay − warmup)
//!          = min_lr                                             it ≥ decay
//! ```

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosineWithWarmup {
    pub learning_rate:  f64,
    pub min_lr:         f64,
    pub warmup_iters:   usize,
    pub lr_decay_iters: usize,
}

impl CosineWithWarmup {
    pub fn new(learning_rate: f64, min_lr: f64, warmup_iters: usize, lr_decay_iters: usize) -> Self {
        Self { learning_rate, min_lr, warmup_iters, lr_decay_iters }
    }

    pub fn lr(&self, it: usize) -> f64 {
        if it < self.warmup_iters {
            return self.learning_rate * it as f64 / self.warmup_iters as f64;
        }
        if it >= self.lr_decay_iters || self.lr_decay_iters <= self.warmup_iters {
            return self.min_lr;
        }
        let decay_ratio = (it - self.warmup_iters) as f64
            / (self.lr_decay_iters - self.warmup_iters) as f64;
        let coeff = 0.5 * (1.0 + (PI * decay_ratio).cos());
        self.min_lr + coeff * (self.learning_rate - self.min_lr)
    }
}

/// Learning rate as a function of the iteration number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrSchedule {
    Constant(f64),
    Cosine(CosineWithWarmup),
}

impl LrSchedule {
    pub fn lr(&self, it: usize) -> f64 {
        match self {
            LrSchedule::Constant(lr) => *lr,
            LrSchedule::Cosine(schedule) => schedule.lr(it),
        }
    }
}
