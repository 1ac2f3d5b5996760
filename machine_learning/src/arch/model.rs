use ndarray::{Array4, ArrayView4};

use super::params::{BACKBONE, ParamGroups};
use crate::Result;

/// A model that scores every pixel of an image pair with one logit per class.
///
/// Images are `(N, C, H, W)` and scores are `(N, nclass, H, W)`.
pub trait ChangeDetector: Send {
    /// Returns the amount of classes the model scores.
    fn nclass(&self) -> usize;

    fn params(&self) -> &ParamGroups;

    fn params_mut(&mut self) -> &mut ParamGroups;

    /// Scores the pair and keeps what the next `backward` call needs.
    fn forward(&mut self, a: ArrayView4<f32>, b: ArrayView4<f32>) -> Result<Array4<f32>>;

    /// Accumulates into the gradient of every parameter group the gradient of a loss whose
    /// derivative with respect to the last forward's scores is `d_scores`.
    fn backward(&mut self, d_scores: ArrayView4<f32>) -> Result<()>;

    /// Scores the pair without touching any gradient or forward metadata.
    fn predict(&self, a: ArrayView4<f32>, b: ArrayView4<f32>) -> Result<Array4<f32>>;

    /// Overwrites the backbone group with pretrained weights.
    fn load_backbone(&mut self, params: &[f32]) -> Result<()> {
        self.params_mut().get_mut(BACKBONE)?.load(params)
    }
}
