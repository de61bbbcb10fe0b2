// ============================================================
// Layer 5 — Gradient Utilities
// ============================================================
// Operations over a full set of parameter gradients, walked in
// module order with a `ModuleVisitor`:
//
//   global_norm        ‖g‖₂ over every gradient tensor together
//   scale_gradients    g ← c·g       (loss-scale unscaling)
//   clip_global_norm   g ← g · max/‖g‖  when ‖g‖ > max
//   all_reduce_mean    g ← mean over replicas
//
// Replicas share one architecture, so the visitor order, and
// with it the flat all-reduce buffer layout, is the same on
// every replica. A parameter that received no gradient in this
// step (its task head did not run) contributes zeros, so every
// replica sends a buffer of the same length. The buffer ends with
// one touched flag per parameter; a parameter no replica touched
// gets no gradient back, so the optimizer skips it exactly as in
// a single-process step.

use burn::{
    module::{AutodiffModule, ModuleVisitor, Param, ParamId},
    optim::GradientsParams,
    prelude::*,
    tensor::{backend::AutodiffBackend, TensorData},
};

use crate::ml::distributed::{DistributedError, ProcessGroup};

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

// ─── Visitors ─────────────────────────────────────────────────────────────────
struct SquaredNorm<'a> {
    grads:  &'a GradientsParams,
    sum_sq: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.get::<Inner<B>, D>(param.id) {
            self.sum_sq += grad.powi_scalar(2).sum().into_scalar().elem::<f64>();
        }
    }
}

struct Scale<'a> {
    grads:  &'a mut GradientsParams,
    factor: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Scale<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.remove::<Inner<B>, D>(param.id) {
            self.grads.register(param.id, grad.mul_scalar(self.factor));
        }
    }
}

/// Flattens every gradient (zeros where missing) into one buffer.
struct Flatten<'a> {
    grads:   &'a GradientsParams,
    buffer:  Vec<f32>,
    touched: Vec<f32>,
    layout:  Vec<(ParamId, Vec<usize>)>,
    error:   Option<String>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Flatten<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if self.error.is_some() {
            return;
        }
        let dims = param.val().dims();
        let size: usize = dims.iter().product();
        match self.grads.get::<Inner<B>, D>(param.id) {
            Some(grad) => match grad.into_data().convert::<f32>().to_vec::<f32>() {
                Ok(values) => {
                    self.buffer.extend(values);
                    self.touched.push(1.0);
                }
                Err(e) => {
                    self.error = Some(format!("{e:?}"));
                    return;
                }
            },
            None => {
                self.buffer.extend(std::iter::repeat(0.0).take(size));
                self.touched.push(0.0);
            }
        }
        self.layout.push((param.id, dims.to_vec()));
    }
}

/// Writes a flat buffer back as gradients, in the same visit order.
/// Parameters whose reduced touched flag is zero are left without one.
struct Unflatten<'a, B: AutodiffBackend> {
    grads:   &'a mut GradientsParams,
    buffer:  &'a [f32],
    touched: &'a [f32],
    offset:  usize,
    index:   usize,
    device:  B::Device,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unflatten<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let dims = param.val().dims();
        let size: usize = dims.iter().product();
        let end = (self.offset + size).min(self.buffer.len());
        let values = self.buffer[self.offset..end].to_vec();
        self.offset = end;

        let touched = self.touched.get(self.index).is_some_and(|&flag| flag > 0.0);
        self.index += 1;
        if !touched {
            return;
        }

        let grad = Tensor::<Inner<B>, D>::from_data(TensorData::new(values, dims), &self.device);
        self.grads.remove::<Inner<B>, D>(param.id);
        self.grads.register(param.id, grad);
    }
}

// ─── Public operations ────────────────────────────────────────────────────────
/// L2 norm of all gradients taken together.
pub fn global_norm<B, M>(model: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNorm { grads, sum_sq: 0.0 };
    model.visit(&mut visitor);
    visitor.sum_sq.sqrt()
}

pub fn scale_gradients<B, M>(model: &M, grads: &mut GradientsParams, factor: f64)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = Scale { grads, factor };
    model.visit(&mut visitor);
}

/// Rescale so the global norm is at most `max_norm`. Returns the norm before clipping.
pub fn clip_global_norm<B, M>(model: &M, grads: &mut GradientsParams, max_norm: f64) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = global_norm::<B, M>(model, grads);
    if norm.is_finite() && norm > max_norm {
        scale_gradients::<B, M>(model, grads, max_norm / (norm + 1e-6));
    }
    norm
}

/// Undo loss scaling. Returns false when any gradient is inf or NaN.
pub fn unscale_and_check<B, M>(model: &M, grads: &mut GradientsParams, scale: f64) -> bool
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    if scale != 1.0 {
        scale_gradients::<B, M>(model, grads, 1.0 / scale);
    }
    global_norm::<B, M>(model, grads).is_finite()
}

/// Replace every gradient with its mean across the group.
pub fn all_reduce_mean<B, M>(
    model:  &M,
    grads:  &mut GradientsParams,
    group:  &dyn ProcessGroup,
    device: &B::Device,
) -> Result<(), DistributedError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut flatten = Flatten {
        grads,
        buffer:  Vec::new(),
        touched: Vec::new(),
        layout:  Vec::new(),
        error:   None,
    };
    model.visit(&mut flatten);
    if let Some(error) = flatten.error {
        return Err(DistributedError::Group(format!("cannot read gradient: {error}")));
    }
    let values = flatten.buffer.len();
    let mut buffer = flatten.buffer;
    buffer.extend(flatten.touched);
    tracing::trace!("All-reduce over {} parameters ({} values)", flatten.layout.len(), values);

    group.all_reduce_mean(&mut buffer)?;

    let (values, touched) = buffer.split_at(values);
    let mut unflatten = Unflatten::<B> {
        grads,
        buffer: values,
        touched,
        offset: 0,
        index: 0,
        device: device.clone(),
    };
    model.visit(&mut unflatten);
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};
    use std::thread;

    use crate::ml::distributed::DistributedContext;

    type TestBackend = Autodiff<NdArray>;

    fn linear() -> Linear<TestBackend> {
        LinearConfig::new(3, 2).init(&Default::default())
    }

    /// Gradients of sum(k · linear(x)) for a fixed input.
    fn grads_for(model: &Linear<TestBackend>, k: f32) -> GradientsParams {
        let x = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, -1.0, 0.5, 2.0], [2, 3]),
            &Default::default(),
        );
        let loss = model.forward(x).sum().mul_scalar(k);
        GradientsParams::from_grads(loss.backward(), model)
    }

    #[test]
    fn test_scaling_scales_the_norm() {
        let model = linear();
        let mut grads = grads_for(&model, 1.0);
        let norm = global_norm::<TestBackend, _>(&model, &grads);
        assert!(norm > 0.0);

        scale_gradients::<TestBackend, _>(&model, &mut grads, 0.25);
        let scaled = global_norm::<TestBackend, _>(&model, &grads);
        assert_abs_diff_eq!(scaled, norm * 0.25, epsilon = 1e-5);
    }

    #[test]
    fn test_clipping_bounds_the_norm() {
        let model = linear();
        let mut grads = grads_for(&model, 10.0);
        let before = clip_global_norm::<TestBackend, _>(&model, &mut grads, 1.0);
        assert!(before > 1.0);
        let after = global_norm::<TestBackend, _>(&model, &grads);
        assert!(after <= 1.0 + 1e-5);
        assert_abs_diff_eq!(after, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_clipping_leaves_small_gradients_alone() {
        let model = linear();
        let mut grads = grads_for(&model, 1e-3);
        let before = clip_global_norm::<TestBackend, _>(&model, &mut grads, 100.0);
        let after = global_norm::<TestBackend, _>(&model, &grads);
        assert_abs_diff_eq!(before, after, epsilon = 1e-9);
    }

    #[test]
    fn test_unscale_detects_overflow() {
        let model = linear();
        let mut grads = grads_for(&model, 8.0);
        let reference = global_norm::<TestBackend, _>(&model, &grads_for(&model, 1.0));
        assert!(unscale_and_check::<TestBackend, _>(&model, &mut grads, 8.0));
        assert_abs_diff_eq!(global_norm::<TestBackend, _>(&model, &grads), reference, epsilon = 1e-4);

        let mut bad = grads_for(&model, f32::INFINITY);
        assert!(!unscale_and_check::<TestBackend, _>(&model, &mut bad, 2.0));
    }

    #[test]
    fn test_all_reduce_averages_replica_gradients() {
        let model = linear();
        let expected = global_norm::<TestBackend, _>(&model, &grads_for(&model, 2.0));

        // Replica r computes k = 1 + 2r → mean over {1, 3} is 2
        let norms: Vec<f64> = thread::scope(|s| {
            let handles: Vec<_> = DistributedContext::local_group(2)
                .into_iter()
                .map(|ctx| {
                    // Fresh leaf tensors per replica, same parameter ids
                    let model = model.clone().fork(&Default::default());
                    s.spawn(move || {
                        let mut grads = grads_for(&model, 1.0 + 2.0 * ctx.rank as f32);
                        all_reduce_mean::<TestBackend, _>(&model, &mut grads, ctx.group(), &Default::default())
                            .unwrap();
                        global_norm::<TestBackend, _>(&model, &grads)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for norm in norms {
            assert_abs_diff_eq!(norm, expected, epsilon = 1e-4);
        }
    }

    #[derive(Module, Debug)]
    struct Heads<B: Backend> {
        a: Linear<B>,
        b: Linear<B>,
        c: Linear<B>,
    }

    #[test]
    fn test_all_reduce_skips_parameters_no_replica_touched() {
        let heads = Heads::<TestBackend> { a: linear(), b: linear(), c: linear() };

        // Rank 0 runs head a, rank 1 runs heads a and b, nobody runs c
        let present: Vec<(bool, bool, bool)> = thread::scope(|s| {
            let handles: Vec<_> = DistributedContext::local_group(2)
                .into_iter()
                .map(|ctx| {
                    let heads = heads.clone().fork(&Default::default());
                    s.spawn(move || {
                        let x = Tensor::<TestBackend, 2>::ones([1, 3], &Default::default());
                        let mut loss = heads.a.forward(x.clone()).sum();
                        if ctx.rank == 1 {
                            loss = loss + heads.b.forward(x).sum();
                        }
                        let mut grads = GradientsParams::from_grads(loss.backward(), &heads);
                        all_reduce_mean::<TestBackend, _>(&heads, &mut grads, ctx.group(), &Default::default())
                            .unwrap();

                        let has = |l: &Linear<TestBackend>| {
                            grads.get::<Inner<TestBackend>, 2>(l.weight.id).is_some()
                        };
                        (has(&heads.a), has(&heads.b), has(&heads.c))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(present, vec![(true, true, false); 2]);
    }
}
