use burn::prelude::*;

/// Everything one forward pass (or loss call) produces.
///
/// Only the heads relevant to the task are run; the logits of the
/// others stay `None`.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// The mask the caller passed in, [batch, seq], 1 = real token
    pub attention_mask:    Option<Tensor<B, 2, Int>>,
    /// Final-norm token embeddings [batch, seq, embed]
    pub embeddings:        Tensor<B, 3>,
    /// Pooled view fed to the prediction heads [batch, embed]
    pub cls_embeddings:    Tensor<B, 2>,
    /// View fed to the vocabulary head [batch, positions, embed]
    pub lm_embeddings:     Tensor<B, 3>,
    /// LM logits for generation, MLM logits after an mlm loss call
    pub logits_generation: Option<Tensor<B, 3>>,
    pub logits_physchem:   Option<Tensor<B, 2>>,
    pub logits_prediction: Option<Tensor<B, 2>>,
    pub layer_embeddings:  Option<Vec<Tensor<B, 3>>>,
    pub loss:              Option<Tensor<B, 1>>,
}

impl<B: Backend> ModelOutput<B> {
    /// Scalar loss value, if one was computed.
    pub fn loss_value(&self) -> Option<f64> {
        self.loss.clone().map(|l| l.into_scalar().elem::<f64>())
    }
}
