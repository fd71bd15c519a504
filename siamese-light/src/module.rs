//! PairModule trait for trainable pairwise models.

use candle::{Result, Tensor, Var};
use candle_nn::VarMap;

/// A network that scores how similar two images are.
///
/// Implementors keep their weights in a [`VarMap`] so the
/// [`Trainer`](crate::Trainer) can snapshot, persist and reload them.
pub trait PairModule {
    /// Score a batch of image pairs. Both inputs are `(B, C, H, W)`; the
    /// result has shape `(B,)`.
    fn forward(&self, left: &Tensor, right: &Tensor) -> Result<Tensor>;

    /// Switch stochastic layers (dropout and the like) between training and
    /// evaluation behaviour.
    fn set_training(&mut self, training: bool);

    /// The variable store holding every trainable weight.
    fn varmap(&self) -> &VarMap;

    /// Mutable access to the store, used when loading saved weights.
    fn varmap_mut(&mut self) -> &mut VarMap;

    /// Return all trainable parameters.
    fn parameters(&self) -> Vec<Var> {
        self.varmap().all_vars()
    }
}
