use std::ops::Range;

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

/// Splits `total` samples among `num_workers` and returns the shard for `worker_id`.
///
/// Properties:
/// - Ranges are contiguous, disjoint and cover `[0..total)`.
/// - Sizes differ by at most 1 (balanced partition).
/// - A `worker_id` past the last worker gets an empty range.
pub fn shard_range(total: usize, worker_id: usize, num_workers: usize) -> Range<usize> {
    let num_workers = num_workers.max(1);
    if worker_id >= num_workers {
        return total..total;
    }

    let base = total / num_workers;
    let rem = total % num_workers;

    let start = worker_id * base + worker_id.min(rem);
    let extra = usize::from(worker_id < rem);
    let end = start + base + extra;

    start..end
}

/// Picks this rank's training samples for every epoch.
///
/// Every epoch the whole index set is shuffled with `seed + epoch`, padded by wrapping
/// around until its length is a multiple of the world size and cut in equal contiguous
/// slices, one per rank. Every rank thus sees the same amount of samples.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    shuffle: bool,
    epoch: usize,
}

impl DistributedSampler {
    pub fn new(len: usize, rank: usize, world_size: usize, seed: u64, shuffle: bool) -> Self {
        Self {
            len,
            rank,
            world_size: world_size.max(1),
            seed,
            shuffle,
            epoch: 0,
        }
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// The amount of samples every rank gets per epoch.
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    /// This rank's sample indices for the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let mut indices: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            indices.shuffle(&mut rng);
        }

        let num_samples = self.num_samples();
        let total = num_samples * self.world_size;
        let padded: Vec<usize> = indices.iter().copied().cycle().take(total).collect();

        let start = self.rank * num_samples;
        padded[start..start + num_samples].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn shard_range_balanced() {
        // total 10, workers 3 => sizes 4,3,3
        assert_eq!(shard_range(10, 0, 3), 0..4);
        assert_eq!(shard_range(10, 1, 3), 4..7);
        assert_eq!(shard_range(10, 2, 3), 7..10);
    }

    #[test]
    fn shard_range_with_more_workers_than_samples() {
        assert_eq!(shard_range(1, 0, 2), 0..1);
        assert_eq!(shard_range(1, 1, 2), 1..1);
    }

    #[test]
    fn shard_range_past_the_last_worker_is_empty() {
        assert_eq!(shard_range(10, 3, 3), 10..10);
        assert_eq!(shard_range(10, 7, 3), 10..10);
        assert!(shard_range(0, 1, 1).is_empty());
    }

    #[test]
    fn ranks_split_a_padded_permutation() {
        let world = 3;
        let samplers: Vec<_> = (0..world)
            .map(|rank| DistributedSampler::new(10, rank, world, 7, true))
            .collect();

        let all: Vec<usize> = samplers.iter().flat_map(DistributedSampler::indices).collect();

        assert!(samplers.iter().all(|s| s.indices().len() == 4));
        assert_eq!(all.len(), 12);
        assert_eq!(all.iter().copied().collect::<HashSet<_>>().len(), 10);
    }

    #[test]
    fn epochs_reshuffle_deterministically() {
        let mut a = DistributedSampler::new(50, 0, 2, 1, true);
        let b = DistributedSampler::new(50, 0, 2, 1, true);

        let first = a.indices();
        assert_eq!(first, b.indices());

        a.set_epoch(1);
        assert_ne!(a.indices(), first);
    }

    #[test]
    fn unshuffled_sampler_keeps_order() {
        let sampler = DistributedSampler::new(5, 1, 2, 0, false);
        // Padded to [0, 1, 2, 3, 4, 0], rank 1 takes the second half.
        assert_eq!(sampler.indices(), vec![3, 4, 0]);
    }
}
