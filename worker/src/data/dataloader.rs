use std::{ops::Range, sync::Arc};

use machine_learning::MlErr;
use ndarray::{Array3, Array4, ArrayView2, ArrayView3, Axis, stack};

use super::{ChangeDataset, DistributedSampler, Sample, shard_range, transform};
use crate::error::{Result, WorkerErr};

/// A stack of samples of the same size.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `(N, C, H, W)`.
    pub image_a: Array4<f32>,
    /// `(N, C, H, W)`.
    pub image_b: Array4<f32>,
    /// `(N, H, W)`.
    pub mask: Array3<u8>,
}

impl Batch {
    /// Stacks `samples` along a new leading axis.
    pub fn stack(samples: &[Sample]) -> Result<Self> {
        let image_a: Vec<ArrayView3<f32>> = samples.iter().map(|s| s.image_a.view()).collect();
        let image_b: Vec<ArrayView3<f32>> = samples.iter().map(|s| s.image_b.view()).collect();
        let mask: Vec<ArrayView2<u8>> = samples.iter().map(|s| s.mask.view()).collect();

        Ok(Self {
            image_a: stack(Axis(0), &image_a).map_err(MlErr::from)?,
            image_b: stack(Axis(0), &image_b).map_err(MlErr::from)?,
            mask: stack(Axis(0), &mask).map_err(MlErr::from)?,
        })
    }

    pub fn len(&self) -> usize {
        self.mask.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loads this rank's augmented training batches.
///
/// The last incomplete batch of an epoch is dropped, so every rank runs exactly
/// `steps_per_epoch` steps.
pub struct TrainLoader {
    dataset: Arc<dyn ChangeDataset>,
    sampler: DistributedSampler,
    indices: Vec<usize>,
    batch_size: usize,
    crop_size: usize,
    ignore_label: u8,
    seed: u64,
}

impl TrainLoader {
    pub fn new(
        dataset: Arc<dyn ChangeDataset>,
        sampler: DistributedSampler,
        batch_size: usize,
        crop_size: usize,
        ignore_label: u8,
        seed: u64,
    ) -> Self {
        let indices = sampler.indices();

        Self {
            dataset,
            sampler,
            indices,
            batch_size: batch_size.max(1),
            crop_size,
            ignore_label,
            seed,
        }
    }

    /// Reshuffles for `epoch`.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
        self.indices = self.sampler.indices();
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.sampler.num_samples() / self.batch_size
    }

    /// Loads the `step`-th batch of the current epoch.
    pub fn batch(&self, step: usize) -> Result<Batch> {
        let start = step * self.batch_size;
        let indices = self
            .indices
            .get(start..start + self.batch_size)
            .ok_or_else(|| WorkerErr::Config(format!("step {step} is past the end of the epoch")))?;

        let epoch = self.sampler.epoch();
        let samples = indices
            .iter()
            .map(|&idx| {
                let sample = self.dataset.get(idx)?;
                let mut rng = transform::sample_rng(self.seed, epoch, idx);
                transform::random_crop_flip(sample, self.crop_size, self.ignore_label, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        Batch::stack(&samples)
    }
}

/// Loads this rank's contiguous shard of the validation set, one sample per batch.
pub struct EvalLoader {
    dataset: Arc<dyn ChangeDataset>,
    range: Range<usize>,
}

impl EvalLoader {
    pub fn new(dataset: Arc<dyn ChangeDataset>, rank: usize, world_size: usize) -> Self {
        let range = shard_range(dataset.len(), rank, world_size);
        Self { dataset, range }
    }

    pub fn shard_range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Loads the samples of the shard in order.
    pub fn iter(&self) -> impl Iterator<Item = Result<Batch>> + '_ {
        self.range.clone().map(|idx| {
            let sample = self.dataset.get(idx)?;
            Batch::stack(std::slice::from_ref(&sample))
        })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;
    use crate::data::InMemoryDataset;

    fn dataset(n: usize) -> Arc<dyn ChangeDataset> {
        let samples = (0..n)
            .map(|i| {
                let image = Array::from_elem((1, 2, 2), i as f32);
                let mask = Array::from_elem((2, 2), (i % 2) as u8);
                Sample::new(i.to_string(), image.clone(), image, mask).unwrap()
            })
            .collect();

        Arc::new(InMemoryDataset::new(samples))
    }

    #[test]
    fn eval_shards_cover_the_set() {
        let data = dataset(5);
        let loaders: Vec<_> = (0..2).map(|rank| EvalLoader::new(data.clone(), rank, 2)).collect();

        assert_eq!(loaders[0].shard_range(), 0..3);
        assert_eq!(loaders[1].shard_range(), 3..5);

        let firsts: Vec<f32> = loaders[1]
            .iter()
            .map(|batch| batch.unwrap().image_a[[0, 0, 0, 0]])
            .collect();
        assert_eq!(firsts, vec![3.0, 4.0]);
    }

    #[test]
    fn train_batches_drop_the_tail() {
        let sampler = DistributedSampler::new(7, 0, 2, 0, true);
        let mut loader = TrainLoader::new(dataset(7), sampler, 3, 2, 255, 0);

        // 4 samples per rank, batches of 3.
        assert_eq!(loader.steps_per_epoch(), 1);
        let batch = loader.batch(0).unwrap();
        assert_eq!(batch.image_a.dim(), (3, 1, 2, 2));
        assert_eq!(batch.mask.dim(), (3, 2, 2));
        assert!(loader.batch(1).is_err());

        loader.set_epoch(3);
        assert_eq!(loader.batch(0).unwrap().len(), 3);
    }
}
