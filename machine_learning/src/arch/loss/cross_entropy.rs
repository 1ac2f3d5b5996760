use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};

use super::LossFn;
use crate::{MlErr, Result};

/// Label of pixels that take no part in the loss.
pub const IGNORE_LABEL: u8 = 255;

/// Softmax cross-entropy averaged over the pixels whose label is not ignored.
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropy {
    ignore_label: u8,
}

impl Default for CrossEntropy {
    fn default() -> Self {
        Self::new(IGNORE_LABEL)
    }
}

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    ///
    /// # Arguments
    /// * `ignore_label` - Pixels with this label contribute neither loss nor gradient.
    pub fn new(ignore_label: u8) -> Self {
        Self { ignore_label }
    }

    pub fn ignore_label(&self) -> u8 {
        self.ignore_label
    }

    fn check(&self, scores: &ArrayView2<f32>, labels: &ArrayView1<u8>) -> Result<usize> {
        if scores.nrows() != labels.len() {
            return Err(MlErr::SizeMismatch {
                what: "labels",
                got: labels.len(),
                expected: scores.nrows(),
            });
        }

        let nclass = scores.ncols();
        let mut valid = 0;
        for &label in labels {
            if label == self.ignore_label {
                continue;
            }

            if label as usize >= nclass {
                return Err(MlErr::InvalidLabel { label, nclass });
            }

            valid += 1;
        }

        Ok(valid)
    }
}

/// Row-wise numerically stable softmax.
fn softmax(scores: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = scores.to_owned();

    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    probs
}

impl LossFn for CrossEntropy {
    fn loss(&self, scores: ArrayView2<f32>, labels: ArrayView1<u8>) -> Result<f32> {
        let valid = self.check(&scores, &labels)?;
        if valid == 0 {
            return Ok(0.0);
        }

        let mut total = 0.0;
        for (row, &label) in scores.axis_iter(Axis(0)).zip(labels) {
            if label == self.ignore_label {
                continue;
            }

            let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
            let log_sum = row.fold(0.0, |acc, &x| acc + (x - max).exp()).ln() + max;
            total += log_sum - row[label as usize];
        }

        Ok(total / valid as f32)
    }

    fn loss_prime(&self, scores: ArrayView2<f32>, labels: ArrayView1<u8>) -> Result<Array2<f32>> {
        let valid = self.check(&scores, &labels)?;
        if valid == 0 {
            return Ok(Array2::zeros(scores.dim()));
        }

        let mut d = softmax(scores);
        let scale = 1.0 / valid as f32;

        Zip::from(d.rows_mut()).and(labels).for_each(|mut row, &label| {
            if label == self.ignore_label {
                row.fill(0.0);
                return;
            }

            row[label as usize] -= 1.0;
            row *= scale;
        });

        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn uniform_scores_give_log_nclass() {
        let ce = CrossEntropy::default();
        let scores = array![[0.0_f32, 0.0], [0.0, 0.0]];
        let labels = array![0_u8, 1];

        let loss = ce.loss(scores.view(), labels.view()).unwrap();
        assert!((loss - 2.0_f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn ignored_pixels_take_no_part() {
        let ce = CrossEntropy::default();
        let scores = array![[2.0_f32, -1.0], [100.0, -100.0]];
        let labels = array![0_u8, IGNORE_LABEL];

        let only_first = ce
            .loss(scores.slice(ndarray::s![..1, ..]), labels.slice(ndarray::s![..1]))
            .unwrap();
        assert_eq!(ce.loss(scores.view(), labels.view()).unwrap(), only_first);

        let d = ce.loss_prime(scores.view(), labels.view()).unwrap();
        assert_eq!(d.row(1), array![0.0, 0.0]);
    }

    #[test]
    fn all_ignored_is_zero() {
        let ce = CrossEntropy::default();
        let scores = array![[1.0_f32, 3.0]];
        let labels = array![IGNORE_LABEL];

        assert_eq!(ce.loss(scores.view(), labels.view()).unwrap(), 0.0);
        assert!(ce.loss_prime(scores.view(), labels.view()).unwrap().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn gradient_rows_sum_to_zero() {
        let ce = CrossEntropy::default();
        let scores = array![[0.3_f32, -1.2, 2.0], [1.0, 1.0, 0.0]];
        let labels = array![2_u8, 0];

        let d = ce.loss_prime(scores.view(), labels.view()).unwrap();
        for row in d.rows() {
            assert!(row.sum().abs() < 1e-6);
        }
    }

    #[test]
    fn out_of_range_label_is_an_error() {
        let ce = CrossEntropy::default();
        let scores = array![[0.0_f32, 0.0]];
        let labels = array![2_u8];

        assert_eq!(
            ce.loss(scores.view(), labels.view()),
            Err(MlErr::InvalidLabel { label: 2, nclass: 2 })
        );
    }
}
