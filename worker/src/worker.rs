use std::fs;

use log::{debug, info};

use crate::{
    builder::WorkerBuilder,
    config::{RunArgs, TrainConfig},
    dist::{self, CollectiveChannel, DistributedContext},
    error::{Result, WorkerErr},
    loop_::Phase,
};

/// Runs one worker of a training run from start to finish.
///
/// Every process of the run calls this with the same arguments, the launcher variables
/// tell them apart.
///
/// # Errors
/// Returns the first error hit, every error is fatal.
pub async fn run(args: RunArgs) -> Result<()> {
    let config = TrainConfig::load(&args.config)?;
    let DistributedContext {
        identity,
        mut channel,
    } = dist::setup(args.port).await?;

    debug!(
        rank = identity.rank, world_size = identity.world_size, local_rank = identity.local_rank;
        "worker bound to {:?}", identity.device
    );

    if identity.is_main() {
        let yaml = serde_yaml::to_string(&config).map_err(|e| WorkerErr::Config(e.to_string()))?;
        info!(
            "config:\n{yaml}labeled_id_path: {}\nsave_path: {}\nworld_size: {}",
            args.labeled_id_path.display(),
            args.save_path.display(),
            identity.world_size,
        );

        fs::create_dir_all(&args.save_path)?;
    }

    let mut training = WorkerBuilder::new(&config, &args, identity)
        .build(&mut channel)
        .await?;

    if training.resume(&mut channel).await? == Phase::Resumed && training.start_epoch() >= config.epochs {
        info!(epochs = config.epochs; "checkpoint already covers every epoch");
    }

    let reports = training.run(&mut channel).await?;
    channel.shutdown().await?;

    if identity.is_main() {
        let best = training.best();
        info!(
            epochs_run = reports.len();
            "training finished, best Changed IoU: {:.2}, Overall Accuracy: {:.2}",
            best.best_iou,
            best.best_acc,
        );
    }

    Ok(())
}
