use ndarray::{ArrayView3, Zip};

use crate::{MlErr, Result};

/// Per-class pixel counts of a segmentation pass.
///
/// The counts are plain sums, so the counts of disjoint shards merge by addition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub intersection: Vec<u64>,
    pub union: Vec<u64>,
    pub target: Vec<u64>,
    pub correct: u64,
    pub total: u64,
}

impl ConfusionCounts {
    /// Creates zeroed counts for `nclass` classes.
    pub fn new(nclass: usize) -> Self {
        Self {
            intersection: vec![0; nclass],
            union: vec![0; nclass],
            target: vec![0; nclass],
            correct: 0,
            total: 0,
        }
    }

    pub fn nclass(&self) -> usize {
        self.intersection.len()
    }

    /// Counts the intersection, union and target area of every class.
    ///
    /// Pixels labeled `ignore_label` are left out of the per-class areas, and so are
    /// predictions outside `[0, nclass)`. `correct` and `total` count over every pixel.
    ///
    /// # Arguments
    /// * `pred` - The predicted class of every pixel.
    /// * `target` - The ground truth of every pixel.
    /// * `nclass` - The amount of classes.
    /// * `ignore_label` - The label of pixels without ground truth.
    pub fn intersection_and_union(
        pred: ArrayView3<u8>,
        target: ArrayView3<u8>,
        nclass: usize,
        ignore_label: u8,
    ) -> Result<Self> {
        if pred.dim() != target.dim() {
            return Err(MlErr::ShapeMismatch {
                what: "prediction and target",
                got: pred.shape().to_vec(),
                expected: target.shape().to_vec(),
            });
        }

        let mut counts = Self::new(nclass);
        let mut area_pred = vec![0u64; nclass];

        Zip::from(&pred).and(&target).for_each(|&p, &t| {
            counts.total += 1;
            if p == t {
                counts.correct += 1;
            }

            if t == ignore_label {
                return;
            }

            let (p, t) = (p as usize, t as usize);
            if p < nclass {
                area_pred[p] += 1;
                if p == t {
                    counts.intersection[p] += 1;
                }
            }

            if t < nclass {
                counts.target[t] += 1;
            }
        });

        for (c, union) in counts.union.iter_mut().enumerate() {
            *union = area_pred[c] + counts.target[c] - counts.intersection[c];
        }

        Ok(counts)
    }

    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if other.nclass() != self.nclass() {
            return Err(MlErr::SizeMismatch {
                what: "confusion counts",
                got: other.nclass(),
                expected: self.nclass(),
            });
        }

        let add = |acc: &mut [u64], x: &[u64]| acc.iter_mut().zip(x).for_each(|(a, b)| *a += b);
        add(&mut self.intersection, &other.intersection);
        add(&mut self.union, &other.union);
        add(&mut self.target, &other.target);
        self.correct += other.correct;
        self.total += other.total;
        Ok(())
    }
}
