use std::sync::Arc;

use log::info;
use machine_learning::{
    arch::{
        ChangeDetector, SiameseNet,
        loss::IGNORE_LABEL,
        params::{BACKBONE, HEAD},
    },
    optimization::{AdamW, AdamWConfig},
};

use crate::{
    checkpoint::CheckpointManager,
    config::{RunArgs, TrainConfig},
    data::{ChangeDataset, DistributedSampler, EvalLoader, FileDataset, TrainLoader, read_ids, upsample_ids},
    dist::{CollectiveChannel, WorkerIdentity},
    error::{Result, WorkerErr},
    loop_::{Loaders, LoopSettings, TrainingLoop},
    model::{self, ReplicatedModel},
    schedule::LrSchedule,
    sink::{JsonlSink, MetricsSink, NullSink},
};

/// Name of the validation id list inside the data root.
pub const VAL_IDS: &str = "val.txt";

/// Assembles a worker's training loop from the run configuration.
pub struct WorkerBuilder<'a> {
    config: &'a TrainConfig,
    args: &'a RunArgs,
    identity: WorkerIdentity,
}

impl<'a> WorkerBuilder<'a> {
    pub fn new(config: &'a TrainConfig, args: &'a RunArgs, identity: WorkerIdentity) -> Self {
        Self {
            config,
            args,
            identity,
        }
    }

    /// Builds the training loop.
    ///
    /// The model is replicated through `channel`, so every worker must call this.
    ///
    /// # Errors
    /// Returns an error if the model, the datasets or the optimizer can't be built.
    pub async fn build<C: CollectiveChannel>(
        &self,
        channel: &mut C,
    ) -> Result<TrainingLoop<SiameseNet, AdamW>> {
        let config = self.config;
        let is_main = self.identity.is_main();

        let model = model::build_model(config)?;
        let model = ReplicatedModel::new(model, channel).await?;

        let optimizer = AdamW::new(
            model.inner().params(),
            &[
                (BACKBONE, config.lr as f32),
                (HEAD, (config.lr * config.lr_multi) as f32),
            ],
            AdamWConfig::default(),
        )?;

        let loaders = self.loaders()?;
        let steps = loaders.train.steps_per_epoch();
        let schedule = LrSchedule::new(config.lr, config.lr_multi, (steps * config.epochs) as u64);

        let checkpoints = CheckpointManager::new(&self.args.save_path, is_main);
        let sink: Box<dyn MetricsSink> = if is_main {
            Box::new(JsonlSink::open(&self.args.save_path.join(JsonlSink::FILE_NAME)))
        } else {
            Box::new(NullSink)
        };

        let settings = LoopSettings {
            epochs: config.epochs,
            nclass: config.nclass,
            ignore_label: IGNORE_LABEL,
            resize_multiple: config.resize_multiple(),
            is_main,
        };

        Ok(TrainingLoop::new(model, optimizer, loaders, schedule, checkpoints, sink, settings))
    }

    /// Builds this worker's training and validation loaders.
    ///
    /// # Errors
    /// Returns `WorkerErr::Config` if a worker would get no full training batch.
    pub fn loaders(&self) -> Result<Loaders> {
        let config = self.config;
        let WorkerIdentity { rank, world_size, .. } = self.identity;

        let ids = upsample_ids(read_ids(&self.args.labeled_id_path)?, &config.dataset);
        let train: Arc<dyn ChangeDataset> = Arc::new(FileDataset::new(&config.data_root, ids));

        let val_ids = read_ids(&config.data_root.join(VAL_IDS))?;
        let val: Arc<dyn ChangeDataset> = Arc::new(FileDataset::new(&config.data_root, val_ids));

        let sampler = DistributedSampler::new(train.len(), rank, world_size, config.seed, true);
        let per_worker = sampler.num_samples();
        let train = TrainLoader::new(
            train,
            sampler,
            config.batch_size,
            config.crop_size,
            IGNORE_LABEL,
            config.seed,
        );

        if train.steps_per_epoch() == 0 {
            return Err(WorkerErr::Config(format!(
                "batch_size {} is larger than the {} labeled samples of a worker",
                config.batch_size, per_worker,
            )));
        }

        let eval = EvalLoader::new(val, rank, world_size);

        if self.identity.is_main() {
            info!(
                train_steps = train.steps_per_epoch(), val_samples = eval.len();
                "built data loaders"
            );
        }

        Ok(Loaders { train, eval })
    }
}
