// ============================================================
// Layer 5 — Task Losses
// ============================================================
//   lm / mlm      cross-entropy over the vocabulary, positions
//                 labelled IGNORE_INDEX excluded, mean over the rest
//   physchem      MSE over the flattened property vectors
//   prediction    regression             → MSE
//                 classification, 1 task → 2-class cross-entropy,
//                                          targets hold the class index
//                 classification, n > 1  → mean binary cross-entropy
//                                          with logits (multi-label)

use burn::{
    nn::loss::{CrossEntropyLossConfig, MseLoss, Reduction},
    prelude::*,
    tensor::activation::log_softmax,
};

use crate::ml::error::{ModelError, Result};

/// Label value that marks a position as not contributing to the loss.
pub const IGNORE_INDEX: i64 = -100;

/// logits: [N, V], targets: [N] → scalar mean over non-ignored targets.
///
/// A batch where every target is ignored yields 0.
pub fn cross_entropy_with_ignore<B: Backend>(
    logits:  Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [n, _] = logits.dims();

    let ignored = targets.clone().equal_elem(IGNORE_INDEX);
    let weights = ignored.clone().bool_not().float();
    // Any in-range index works for ignored rows; they are weighted out below
    let safe_targets = targets.mask_fill(ignored, 0);

    let picked = log_softmax(logits, 1)
        .gather(1, safe_targets.reshape([n, 1]))
        .reshape([n]);

    let total = (picked * weights.clone()).sum().neg();
    let count = weights.sum().clamp_min(1.0);
    total / count
}

/// Mean squared error over both tensors flattened.
pub fn mse_flat<B: Backend>(prediction: Tensor<B, 2>, target: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
    check_same_size(&prediction.dims(), &target.dims())?;
    let prediction = prediction.flatten::<1>(0, 1);
    let target = target.flatten::<1>(0, 1);
    Ok(MseLoss::new().forward(prediction, target, Reduction::Mean))
}

/// Numerically stable mean binary cross-entropy on raw logits:
///   max(x, 0) − x·y + log(1 + e^(−|x|))
pub fn binary_cross_entropy_with_logits<B: Backend>(
    logits:  Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Result<Tensor<B, 1>> {
    if logits.dims() != targets.dims() {
        return Err(ModelError::TargetShape {
            expected: logits.dims().to_vec(),
            got:      targets.dims().to_vec(),
        });
    }
    let loss = logits.clone().clamp_min(0.0)
        - logits.clone() * targets
        + logits.abs().neg().exp().log1p();
    Ok(loss.mean())
}

/// Two-class cross-entropy where `targets` [B, 1] holds the class index as a float.
pub fn binary_class_cross_entropy<B: Backend>(
    logits:  Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Result<Tensor<B, 1>> {
    let [batch, _] = logits.dims();
    let [rows, cols] = targets.dims();
    if rows != batch || cols != 1 {
        return Err(ModelError::TargetShape {
            expected: vec![batch, 1],
            got:      vec![rows, cols],
        });
    }
    let classes = targets.reshape([batch]).int();
    let ce = CrossEntropyLossConfig::new().init(&logits.device());
    Ok(ce.forward(logits, classes))
}

fn check_same_size(expected: &[usize], got: &[usize]) -> Result<()> {
    let size = |dims: &[usize]| dims.iter().product::<usize>();
    if size(expected) != size(got) {
        return Err(ModelError::TargetShape {
            expected: expected.to_vec(),
            got:      got.to_vec(),
        });
    }
    Ok(())
}
