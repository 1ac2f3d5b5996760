use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::Result;

/// A loss over per-pixel class scores and integer labels.
///
/// Both methods take the scores as a `pixels x nclass` matrix and the labels as one entry
/// per pixel.
pub trait LossFn {
    fn loss(&self, scores: ArrayView2<f32>, labels: ArrayView1<u8>) -> Result<f32>;
    fn loss_prime(&self, scores: ArrayView2<f32>, labels: ArrayView1<u8>) -> Result<Array2<f32>>;
}
