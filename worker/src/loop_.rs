use log::{debug, info};
use machine_learning::{
    arch::{
        ChangeDetector,
        loss::{CrossEntropy, LossFn},
        params::BACKBONE,
    },
    ops,
    optimization::Optimizer,
};
use ndarray::Array1;

use crate::{
    checkpoint::CheckpointManager,
    data::{EvalLoader, TrainLoader},
    dist::CollectiveChannel,
    error::{Result, WorkerErr},
    eval::{self, Evaluation},
    metrics::AverageMeter,
    model::ReplicatedModel,
    schedule::LrSchedule,
    sink::MetricsSink,
    state::{BestTracker, TrainingState},
};

/// Where the loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Built, no checkpoint looked at yet or none found.
    Fresh,
    /// A checkpoint was restored, training continues after its epoch.
    Resumed,
    Running,
    EpochComplete,
    Finished,
}

/// The loaders of a run.
pub struct Loaders {
    pub train: TrainLoader,
    pub eval: EvalLoader,
}

/// The fixed knobs of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub epochs: usize,
    pub nclass: usize,
    pub ignore_label: u8,
    pub resize_multiple: Option<usize>,
    /// Whether this worker logs, writes metrics and writes checkpoints.
    pub is_main: bool,
}

/// The outcome of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub eval: Evaluation,
    pub is_best: bool,
    pub best: BestTracker,
}

/// Drives the epochs of a run: training steps, evaluation and checkpoints.
///
/// Every worker runs the same loop and issues the same collectives in the same order.
pub struct TrainingLoop<M, O>
where
    M: ChangeDetector,
    O: Optimizer,
{
    model: ReplicatedModel<M>,
    optimizer: O,
    loaders: Loaders,
    schedule: LrSchedule,
    checkpoints: CheckpointManager,
    sink: Box<dyn MetricsSink>,
    criterion: CrossEntropy,
    settings: LoopSettings,
    phase: Phase,
    start_epoch: usize,
    best: BestTracker,
}

impl<M, O> TrainingLoop<M, O>
where
    M: ChangeDetector + Sync,
    O: Optimizer + Send,
{
    pub fn new(
        model: ReplicatedModel<M>,
        optimizer: O,
        loaders: Loaders,
        schedule: LrSchedule,
        checkpoints: CheckpointManager,
        sink: Box<dyn MetricsSink>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            model,
            optimizer,
            loaders,
            schedule,
            checkpoints,
            sink,
            criterion: CrossEntropy::new(settings.ignore_label),
            settings,
            phase: Phase::Fresh,
            start_epoch: 0,
            best: BestTracker::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn best(&self) -> BestTracker {
        self.best
    }

    pub fn model(&self) -> &ReplicatedModel<M> {
        &self.model
    }

    /// Restores the latest checkpoint if there is one, then checks every rank starts
    /// from the same epoch.
    ///
    /// # Errors
    /// Returns `WorkerErr::Checkpoint` if the checkpoint exists but can't be read, an
    /// error if it doesn't fit the model or optimizer, or `WorkerErr::Protocol` if the
    /// ranks resumed from different epochs.
    pub async fn resume<C: CollectiveChannel>(&mut self, channel: &mut C) -> Result<Phase> {
        if let Some(state) = self.checkpoints.resume()? {
            self.best = state.best();
            self.start_epoch = state.epoch + 1;
            self.model.inner_mut().params_mut().restore(&state.model)?;
            self.optimizer.load_state(state.optimizer)?;
            self.phase = Phase::Resumed;

            if self.settings.is_main {
                info!(
                    epoch = state.epoch, best_iou = state.best_iou;
                    "resumed from {}", self.checkpoints.latest_path().display()
                );
            }
        }

        self.agree_on_start_epoch(channel).await?;
        Ok(self.phase)
    }

    /// All the ranks hold the same start epoch iff the sum of the epochs and the sum of
    /// their squares are both `world_size` times the local ones.
    async fn agree_on_start_epoch<C: CollectiveChannel>(&self, channel: &mut C) -> Result<()> {
        let start = self.start_epoch as u64;
        let world = channel.world_size() as u64;
        let mut sums = [start, start * start];

        channel.all_reduce_sum(&mut sums).await?;

        if sums != [world * start, world * start * start] {
            return Err(WorkerErr::protocol(format!(
                "rank {} resumes from epoch {start} but the ranks disagree",
                channel.rank()
            )));
        }

        Ok(())
    }

    /// Trains from the start epoch to the last one.
    ///
    /// # Returns
    /// The report of every epoch run by this call.
    pub async fn run<C: CollectiveChannel>(&mut self, channel: &mut C) -> Result<Vec<EpochReport>> {
        let mut reports = Vec::new();

        for epoch in self.start_epoch..self.settings.epochs {
            self.phase = Phase::Running;
            self.train_epoch(epoch, channel).await?;

            reports.push(self.complete_epoch(epoch, channel).await?);
            self.phase = Phase::EpochComplete;
        }

        self.phase = Phase::Finished;
        self.sink.flush();
        Ok(reports)
    }

    async fn train_epoch<C: CollectiveChannel>(&mut self, epoch: usize, channel: &mut C) -> Result<()> {
        let is_main = self.settings.is_main;

        if is_main {
            info!(
                "===========> Epoch: {epoch}, LR: {:.7}, Previous best Changed IoU: {:.2}, Overall Accuracy: {:.2}",
                self.optimizer.learning_rate(BACKBONE)?,
                self.best.best_iou,
                self.best.best_acc,
            );
        }

        self.loaders.train.set_epoch(epoch);
        let steps = self.loaders.train.steps_per_epoch();
        let log_every = (steps / 8).max(2);
        let mut meter = AverageMeter::default();

        for step in 0..steps {
            let batch = self.loaders.train.batch(step)?;
            let (n, _, h, w) = batch.image_a.dim();

            let scores = self.model.forward(batch.image_a.view(), batch.image_b.view())?;
            let pixels = ops::to_pixels(scores.view())?;
            let labels: Array1<u8> = batch.mask.iter().copied().collect();

            let loss = self.criterion.loss(pixels.view(), labels.view())?;
            let d_pixels = self.criterion.loss_prime(pixels.view(), labels.view())?;
            let d_scores = ops::from_pixels(d_pixels.view(), (n, h, w))?;

            channel.barrier().await?;

            self.model.inner_mut().params_mut().zero_grad();
            self.model.backward(d_scores.view(), channel).await?;
            self.optimizer.step(self.model.inner_mut().params_mut())?;

            let iter = (epoch * steps + step) as u64;
            let lr = self.schedule.apply(&mut self.optimizer, iter)?;

            meter.update(loss as f64, 1);
            debug!(epoch = epoch, step = step, loss = loss, lr = lr; "step done");

            if is_main {
                self.sink.add_scalar("train/loss_all", loss as f64, iter);
                self.sink.add_scalar("train/loss_x", loss as f64, iter);

                if step % log_every == 0 {
                    info!("Iters: {step}, Total loss: {:.3}", meter.avg());
                }
            }
        }

        Ok(())
    }

    async fn complete_epoch<C: CollectiveChannel>(
        &mut self,
        epoch: usize,
        channel: &mut C,
    ) -> Result<EpochReport> {
        let settings = self.settings;
        let eval = eval::evaluate(
            self.model.inner(),
            &self.loaders.eval,
            channel,
            settings.nclass,
            settings.ignore_label,
            settings.resize_multiple,
        )
        .await?;

        if settings.is_main {
            info!("***** Evaluation ***** >>>> Unchanged IoU: {:.2}", eval.unchanged_iou());
            info!("***** Evaluation ***** >>>> Changed IoU: {:.2}", eval.changed_iou());
            info!("***** Evaluation ***** >>>> Overall Accuracy: {:.2}", eval.overall_acc);

            let step = epoch as u64;
            self.sink.add_scalar("eval/unchanged_IoU", eval.unchanged_iou(), step);
            self.sink.add_scalar("eval/changed_IoU", eval.changed_iou(), step);
            self.sink.add_scalar("eval/overall_accuracy", eval.overall_acc, step);
        }

        let is_best = self.best.observe(eval.changed_iou(), eval.overall_acc);

        if settings.is_main {
            let state = TrainingState {
                model: self.model.inner().params().snapshot(),
                optimizer: self.optimizer.state(),
                epoch,
                best_iou: self.best.best_iou,
                best_acc: self.best.best_acc,
            };

            self.checkpoints.save_epoch(&state, is_best)?;
        }

        Ok(EpochReport {
            epoch,
            eval,
            is_best,
            best: self.best,
        })
    }
}
