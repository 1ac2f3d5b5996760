use std::{path::Path, sync::Arc};

use machine_learning::{
    arch::{
        BackboneSize, ChangeDetector, SiameseNet,
        params::{BACKBONE, HEAD},
    },
    optimization::{AdamW, AdamWConfig},
};
use ndarray::Array;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tempfile::TempDir;
use worker::{
    Phase, TrainingLoop, checkpoint,
    checkpoint::CheckpointManager,
    data::{ChangeDataset, DistributedSampler, EvalLoader, InMemoryDataset, Sample, TrainLoader},
    dist::LocalChannel,
    loop_::{EpochReport, Loaders, LoopSettings},
    model::ReplicatedModel,
    schedule::LrSchedule,
    sink::NullSink,
};

const EPOCHS: usize = 4;
const BATCH: usize = 2;
const LR: f64 = 1e-2;
const LR_MULTI: f64 = 10.0;

/// Pairs whose mask marks the pixels that got brighter.
fn dataset(n: usize, seed: u64) -> Arc<dyn ChangeDataset> {
    let mut rng = StdRng::seed_from_u64(seed);

    let samples = (0..n)
        .map(|i| {
            let a = Array::from_shape_simple_fn((3, 6, 6), || rng.random_range(0.0..1.0_f32));
            let b = Array::from_shape_simple_fn((3, 6, 6), || rng.random_range(0.0..1.0_f32));
            let mask = Array::from_shape_fn((6, 6), |(y, x)| u8::from(b[[0, y, x]] > a[[0, y, x]]));
            Sample::new(i.to_string(), a, b, mask).unwrap()
        })
        .collect();

    Arc::new(InMemoryDataset::new(samples))
}

fn steps_per_epoch() -> usize {
    8 / BATCH
}

async fn training(dir: &Path, epochs: usize) -> TrainingLoop<SiameseNet, AdamW> {
    let mut channel = LocalChannel::new();
    let model = SiameseNet::new(3, BackboneSize::Small, 2, 11).unwrap();
    let model = ReplicatedModel::new(model, &mut channel).await.unwrap();

    let optimizer = AdamW::new(
        model.inner().params(),
        &[(BACKBONE, LR as f32), (HEAD, (LR * LR_MULTI) as f32)],
        AdamWConfig::default(),
    )
    .unwrap();

    let train = dataset(8, 1);
    let sampler = DistributedSampler::new(train.len(), 0, 1, 5, true);
    let loaders = Loaders {
        train: TrainLoader::new(train, sampler, BATCH, 4, 255, 5),
        eval: EvalLoader::new(dataset(3, 2), 0, 1),
    };

    // The schedule always spans the whole run, a shorter `epochs` stands for a crash.
    let schedule = LrSchedule::new(LR, LR_MULTI, (steps_per_epoch() * EPOCHS) as u64);
    let settings = LoopSettings {
        epochs,
        nclass: 2,
        ignore_label: 255,
        resize_multiple: None,
        is_main: true,
    };

    TrainingLoop::new(
        model,
        optimizer,
        loaders,
        schedule,
        CheckpointManager::new(dir, true),
        Box::new(NullSink),
        settings,
    )
}

async fn run(dir: &Path, epochs: usize) -> (Vec<EpochReport>, TrainingLoop<SiameseNet, AdamW>) {
    let mut training = training(dir, epochs).await;
    training.resume(&mut LocalChannel::new()).await.unwrap();
    let reports = training.run(&mut LocalChannel::new()).await.unwrap();
    (reports, training)
}

#[tokio::test]
async fn fresh_run_checkpoints_every_epoch() {
    let dir = TempDir::new().unwrap();
    let (reports, training) = run(dir.path(), EPOCHS).await;

    assert_eq!(training.phase(), Phase::Finished);
    assert_eq!(reports.len(), EPOCHS);
    assert!(dir.path().join(checkpoint::LATEST).exists());
    assert!(dir.path().join(checkpoint::BEST).exists());

    let latest = checkpoint::load(&dir.path().join(checkpoint::LATEST)).unwrap();
    assert_eq!(latest.epoch, EPOCHS - 1);
    assert_eq!(latest.model, training.model().inner().params().snapshot());

    // The rate left behind is the one set after the last step.
    let total = (steps_per_epoch() * EPOCHS) as u64;
    let schedule = LrSchedule::new(LR, LR_MULTI, total);
    assert_eq!(latest.optimizer[BACKBONE].lr, schedule.lr(total - 1) as f32);
    assert_eq!(latest.optimizer[HEAD].lr, (schedule.lr(total - 1) * LR_MULTI) as f32);
    assert_eq!(latest.optimizer[BACKBONE].step, total);
}

#[tokio::test]
async fn best_iou_never_decreases() {
    let dir = TempDir::new().unwrap();
    let (reports, _) = run(dir.path(), EPOCHS).await;

    let bests: Vec<f64> = reports.iter().map(|report| report.best.best_iou).collect();
    assert!(bests.windows(2).all(|w| w[0] <= w[1]));

    for report in &reports {
        assert_eq!(report.is_best, report.eval.changed_iou() >= report.best.best_iou);
        assert!(report.best.best_iou >= report.eval.changed_iou());
    }

    let best = checkpoint::load(&dir.path().join(checkpoint::BEST)).unwrap();
    let last_best = reports.iter().rev().find(|report| report.is_best).unwrap();
    assert_eq!(best.epoch, last_best.epoch);
    assert_eq!(best.best_iou, last_best.eval.changed_iou());
}

#[tokio::test]
async fn resume_reproduces_the_uninterrupted_run() {
    let straight_dir = TempDir::new().unwrap();
    let (straight, straight_loop) = run(straight_dir.path(), EPOCHS).await;

    let crash_dir = TempDir::new().unwrap();
    let (before, _) = run(crash_dir.path(), 2).await;
    assert_eq!(before.len(), 2);

    let mut resumed = training(crash_dir.path(), EPOCHS).await;
    assert_eq!(resumed.resume(&mut LocalChannel::new()).await.unwrap(), Phase::Resumed);
    assert_eq!(resumed.start_epoch(), 2);
    let after = resumed.run(&mut LocalChannel::new()).await.unwrap();

    let trajectory: Vec<_> = before.iter().chain(&after).map(|report| report.best).collect();
    let expected: Vec<_> = straight.iter().map(|report| report.best).collect();
    assert_eq!(trajectory, expected);
    assert_eq!(after, straight[2..]);
    assert_eq!(
        resumed.model().inner().params().snapshot(),
        straight_loop.model().inner().params().snapshot()
    );
}

#[tokio::test]
async fn finished_checkpoint_trains_no_further() {
    let dir = TempDir::new().unwrap();
    run(dir.path(), EPOCHS).await;
    let saved = checkpoint::load(&dir.path().join(checkpoint::LATEST)).unwrap();

    let (reports, training) = run(dir.path(), EPOCHS).await;

    assert!(reports.is_empty());
    assert_eq!(training.phase(), Phase::Finished);
    assert_eq!(training.best(), saved.best());
    assert_eq!(checkpoint::load(&dir.path().join(checkpoint::LATEST)).unwrap(), saved);
}

#[tokio::test]
async fn malformed_checkpoint_is_fatal() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(checkpoint::LATEST), b"not a checkpoint").unwrap();

    let mut training = training(dir.path(), EPOCHS).await;
    assert!(matches!(
        training.resume(&mut LocalChannel::new()).await,
        Err(worker::WorkerErr::Checkpoint { .. })
    ));
}
