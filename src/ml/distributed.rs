// ============================================================
// Layer 5 — Data-Parallel Context
// ============================================================
// One replica per device. Every replica holds its own model and
// optimizer and computes gradients on its own batches; the only
// synchronisation point is the mean all-reduce of gradients
// before each optimizer step.
//
//   replica 0 ─┐
//   replica 1 ─┼── all_reduce_mean(grads) ──► identical update
//   replica n ─┘
//
// The collective sits behind `ProcessGroup`. `LocalProcessGroup`
// joins replicas that run as threads of one process with a
// mutex + condvar rendezvous. There are no timeouts: a replica
// that never arrives blocks the others.
//
// Rank 0 is the leader. Only the leader evaluates, writes eval
// metrics and persists checkpoints.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistributedError {
    #[error("gradient accumulation steps {steps} must be a positive multiple of the world size {world_size}")]
    Accumulation { steps: usize, world_size: usize },

    #[error("environment variable {name} has invalid value `{value}`")]
    BadVariable { name: &'static str, value: String },

    #[error("rank {rank} is out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("world size {env} from the environment does not match the process group size {group}")]
    WorldSizeMismatch { env: usize, group: usize },

    #[error("all-reduce buffers differ in length: {expected} vs {got}")]
    BufferLength { expected: usize, got: usize },

    #[error("process group failed: {0}")]
    Group(String),
}

pub type Result<T> = std::result::Result<T, DistributedError>;

// ─── ProcessGroup ─────────────────────────────────────────────────────────────
/// Collective communication between replicas.
pub trait ProcessGroup: Send + Sync {
    fn world_size(&self) -> usize;

    /// Replace `buffer` on every replica with the element-wise mean
    /// across all replicas. Blocks until every replica has called it.
    fn all_reduce_mean(&self, buffer: &mut [f32]) -> Result<()>;

    /// Fail every pending and future collective. Called when a replica
    /// stops early so the others do not wait for it forever.
    fn abort(&self, _reason: &str) {}
}

#[derive(Default)]
struct Rendezvous {
    sum:        Vec<f32>,
    arrived:    usize,
    generation: u64,
    result:     Arc<Vec<f32>>,
    failure:    Option<DistributedError>,
}

/// In-process group for replicas running as threads.
pub struct LocalProcessGroup {
    world_size: usize,
    state:      Mutex<Rendezvous>,
    ready:      Condvar,
}

impl LocalProcessGroup {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size: world_size.max(1),
            state:      Mutex::new(Rendezvous::default()),
            ready:      Condvar::new(),
        }
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&self, buffer: &mut [f32]) -> Result<()> {
        let mut state = self.state.lock().map_err(poisoned)?;

        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }

        if state.arrived == 0 {
            state.sum.clear();
            state.sum.extend_from_slice(buffer);
        } else if state.sum.len() != buffer.len() {
            let failure = DistributedError::BufferLength {
                expected: state.sum.len(),
                got:      buffer.len(),
            };
            state.failure = Some(failure.clone());
            self.ready.notify_all();
            return Err(failure);
        } else {
            for (acc, value) in state.sum.iter_mut().zip(buffer.iter()) {
                *acc += value;
            }
        }
        state.arrived += 1;

        if state.arrived == self.world_size {
            let n = self.world_size as f32;
            let mean: Vec<f32> = state.sum.iter().map(|v| v / n).collect();
            state.result = Arc::new(mean);
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            buffer.copy_from_slice(&state.result);
            self.ready.notify_all();
            return Ok(());
        }

        // The result of this round stays in place until every replica
        // has arrived for the next one, so it is safe to read on wake-up.
        let generation = state.generation;
        while state.generation == generation && state.failure.is_none() {
            state = self.ready.wait(state).map_err(poisoned)?;
        }
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        buffer.copy_from_slice(&state.result);
        Ok(())
    }

    fn abort(&self, reason: &str) {
        if let Ok(mut state) = self.state.lock() {
            if state.failure.is_none() {
                state.failure = Some(DistributedError::Group(reason.to_string()));
            }
            self.ready.notify_all();
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> DistributedError {
    DistributedError::Group("rendezvous lock poisoned".into())
}

// ─── DistributedContext ───────────────────────────────────────────────────────
/// Where this replica sits in the group. Passed explicitly to the trainer.
#[derive(Clone)]
pub struct DistributedContext {
    pub rank:       usize,
    pub local_rank: usize,
    pub world_size: usize,
    group:          Arc<dyn ProcessGroup>,
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank)
            .field("local_rank", &self.local_rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl DistributedContext {
    pub fn single_process() -> Self {
        Self {
            rank:       0,
            local_rank: 0,
            world_size: 1,
            group:      Arc::new(LocalProcessGroup::new(1)),
        }
    }

    /// One context per thread replica, all sharing one `LocalProcessGroup`.
    pub fn local_group(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let group: Arc<dyn ProcessGroup> = Arc::new(LocalProcessGroup::new(world_size));
        (0..world_size)
            .map(|rank| Self {
                rank,
                local_rank: rank,
                world_size,
                group: Arc::clone(&group),
            })
            .collect()
    }

    /// Ranks from `RANK`, `LOCAL_RANK` and `WORLD_SIZE`; the launcher
    /// supplies the group. Without `RANK` this is a single process.
    pub fn from_env(group: Arc<dyn ProcessGroup>) -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok(), group)
    }

    fn from_vars(
        var:   impl Fn(&str) -> Option<String>,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<Self> {
        let Some(rank) = var("RANK") else {
            return Ok(Self::single_process());
        };
        let parse = |name: &'static str, value: String| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| DistributedError::BadVariable { name, value })
        };

        let rank = parse("RANK", rank)?;
        let local_rank = match var("LOCAL_RANK") {
            Some(value) => parse("LOCAL_RANK", value)?,
            None => rank,
        };
        let world_size = match var("WORLD_SIZE") {
            Some(value) => parse("WORLD_SIZE", value)?,
            None => 1,
        };

        if world_size != group.world_size() {
            return Err(DistributedError::WorldSizeMismatch {
                env:   world_size,
                group: group.world_size(),
            });
        }
        if rank >= world_size {
            return Err(DistributedError::RankOutOfRange { rank, world_size });
        }

        Ok(Self { rank, local_rank, world_size, group })
    }

    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn group(&self) -> &dyn ProcessGroup {
        self.group.as_ref()
    }

    /// Micro-batches each replica runs so the global count stays `total`.
    pub fn per_replica_accumulation(&self, total: usize) -> Result<usize> {
        if total == 0 || total % self.world_size != 0 {
            return Err(DistributedError::Accumulation {
                steps:      total,
                world_size: self.world_size,
            });
        }
        Ok(total / self.world_size)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_missing_rank_means_single_process() {
        let group = Arc::new(LocalProcessGroup::new(4));
        let ctx = DistributedContext::from_vars(vars(&[]), group).unwrap();
        assert_eq!(ctx.world_size, 1);
        assert!(ctx.is_leader());
        assert!(!ctx.is_distributed());
    }

    #[test]
    fn test_ranks_from_variables() {
        let group = Arc::new(LocalProcessGroup::new(4));
        let ctx = DistributedContext::from_vars(
            vars(&[("RANK", "2"), ("LOCAL_RANK", "0"), ("WORLD_SIZE", "4")]),
            group,
        )
        .unwrap();
        assert_eq!((ctx.rank, ctx.local_rank, ctx.world_size), (2, 0, 4));
        assert!(!ctx.is_leader());
    }

    #[test]
    fn test_bad_variables_are_rejected() {
        let group = Arc::new(LocalProcessGroup::new(2));
        let err = DistributedContext::from_vars(vars(&[("RANK", "x")]), group.clone()).unwrap_err();
        assert!(matches!(err, DistributedError::BadVariable { name: "RANK", .. }));

        let err = DistributedContext::from_vars(vars(&[("RANK", "0"), ("WORLD_SIZE", "3")]), group.clone())
            .unwrap_err();
        assert_eq!(err, DistributedError::WorldSizeMismatch { env: 3, group: 2 });

        let err = DistributedContext::from_vars(vars(&[("RANK", "2"), ("WORLD_SIZE", "2")]), group)
            .unwrap_err();
        assert_eq!(err, DistributedError::RankOutOfRange { rank: 2, world_size: 2 });
    }

    #[test]
    fn test_accumulation_must_divide() {
        let ctx = &DistributedContext::local_group(4)[0];
        assert_eq!(ctx.per_replica_accumulation(40).unwrap(), 10);
        assert!(ctx.per_replica_accumulation(6).is_err());
        assert!(ctx.per_replica_accumulation(0).is_err());
        assert_eq!(DistributedContext::single_process().per_replica_accumulation(5).unwrap(), 5);
    }

    #[test]
    fn test_local_group_averages_across_threads() {
        let contexts = DistributedContext::local_group(3);
        let results: Vec<Vec<f32>> = thread::scope(|s| {
            let handles: Vec<_> = contexts
                .into_iter()
                .map(|ctx| {
                    s.spawn(move || {
                        let mut out = Vec::new();
                        // Two rounds back to back exercise the generation counter
                        for round in 0..2 {
                            let r = ctx.rank as f32;
                            let mut buf = vec![r, 10.0 * r + round as f32];
                            ctx.group().all_reduce_mean(&mut buf).unwrap();
                            out.extend(buf);
                        }
                        out
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for result in results {
            assert_eq!(result, vec![1.0, 10.0, 1.0, 11.0]);
        }
    }

    #[test]
    fn test_abort_releases_waiting_replica() {
        let group = Arc::new(LocalProcessGroup::new(2));
        let waiting = group.clone();
        let handle = thread::spawn(move || waiting.all_reduce_mean(&mut [1.0]));

        group.abort("replica 1 failed");
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err, DistributedError::Group("replica 1 failed".into()));
        assert!(group.all_reduce_mean(&mut [1.0]).is_err());
    }

    #[test]
    fn test_single_member_group_is_identity() {
        let group = LocalProcessGroup::new(1);
        let mut buf = vec![1.5, -2.0];
        group.all_reduce_mean(&mut buf).unwrap();
        assert_eq!(buf, vec![1.5, -2.0]);
    }
}
