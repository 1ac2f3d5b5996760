pub mod dataloader;
pub mod dataset;
pub mod shard;
pub mod transform;

pub use dataloader::{Batch, EvalLoader, TrainLoader};
pub use dataset::{ChangeDataset, FileDataset, InMemoryDataset, Sample, read_ids, upsample_ids};
pub use shard::{DistributedSampler, shard_range};
