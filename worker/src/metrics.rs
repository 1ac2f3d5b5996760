use machine_learning::metrics::ConfusionCounts;
use ndarray::ArrayView3;

use crate::{
    dist::CollectiveChannel,
    error::{Result, WorkerErr},
};

const IOU_EPS: f64 = 1e-10;

/// Accumulates the confusion counts of this worker's shard of an evaluation pass.
#[derive(Debug, Clone)]
pub struct MetricAggregator {
    counts: ConfusionCounts,
    ignore_label: u8,
}

impl MetricAggregator {
    pub fn new(nclass: usize, ignore_label: u8) -> Self {
        Self {
            counts: ConfusionCounts::new(nclass),
            ignore_label,
        }
    }

    /// Adds the counts of one batch of predictions.
    pub fn add_batch(&mut self, pred: ArrayView3<u8>, target: ArrayView3<u8>) -> Result<()> {
        let batch = ConfusionCounts::intersection_and_union(
            pred,
            target,
            self.counts.nclass(),
            self.ignore_label,
        )?;

        self.counts.merge(&batch)?;
        Ok(())
    }

    /// Sums the counts of every worker.
    ///
    /// Issues exactly four reductions, in order: intersection, union, target and
    /// `[correct, total]`. Every worker must call this once per pass.
    pub async fn reduce<C>(self, channel: &mut C) -> Result<ReducedCounts>
    where
        C: CollectiveChannel,
    {
        let mut counts = self.counts;

        channel.all_reduce_sum(&mut counts.intersection).await?;
        channel.all_reduce_sum(&mut counts.union).await?;
        channel.all_reduce_sum(&mut counts.target).await?;

        let mut pixels = [counts.correct, counts.total];
        channel.all_reduce_sum(&mut pixels).await?;
        [counts.correct, counts.total] = pixels;

        if counts.intersection.iter().zip(&counts.union).any(|(i, u)| i > u) {
            return Err(WorkerErr::protocol("reduced intersection exceeds the union"));
        }

        Ok(ReducedCounts(counts))
    }
}

/// Confusion counts summed over every worker, the only source of reported metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedCounts(ConfusionCounts);

impl ReducedCounts {
    pub fn counts(&self) -> &ConfusionCounts {
        &self.0
    }

    /// The intersection over union of every class, in percent.
    pub fn iou_class(&self) -> Vec<f64> {
        self.0
            .intersection
            .iter()
            .zip(&self.0.union)
            .map(|(&i, &u)| i as f64 / (u as f64 + IOU_EPS) * 100.0)
            .collect()
    }

    /// The share of correctly predicted pixels, in percent.
    pub fn overall_acc(&self) -> f64 {
        if self.0.total == 0 {
            return 0.0;
        }

        self.0.correct as f64 / self.0.total as f64 * 100.0
    }
}

/// Running average of a scalar.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: u64,
}

impl AverageMeter {
    pub fn update(&mut self, val: f64, n: u64) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        self.sum / self.count as f64
    }
}
