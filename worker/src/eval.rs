use log::debug;
use machine_learning::{
    arch::ChangeDetector,
    ops::{argmax_channels, resize_bilinear, round_to_multiple},
};

use crate::{
    data::EvalLoader,
    dist::CollectiveChannel,
    error::Result,
    metrics::MetricAggregator,
};

/// The metrics of one evaluation pass over the whole validation set.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// IoU of every class, in percent.
    pub iou_class: Vec<f64>,
    /// Pixel accuracy, in percent.
    pub overall_acc: f64,
}

impl Evaluation {
    pub fn unchanged_iou(&self) -> f64 {
        self.iou_class.first().copied().unwrap_or_default()
    }

    pub fn changed_iou(&self) -> f64 {
        self.iou_class.get(1).copied().unwrap_or_default()
    }
}

/// Evaluates `model` over this worker's shard then reduces the counts over every worker.
///
/// # Arguments
/// * `model` - The model, only its inference path is used.
/// * `loader` - This worker's shard of the validation set.
/// * `channel` - The run's collectives.
/// * `nclass` - The amount of classes.
/// * `ignore_label` - Target value of pixels left out of the counts.
/// * `resize_multiple` - When set, inputs are resized so their spatial dims are multiples
///   of it and the scores are resized back.
///
/// # Returns
/// The global metrics, identical on every worker.
pub async fn evaluate<M, C>(
    model: &M,
    loader: &EvalLoader,
    channel: &mut C,
    nclass: usize,
    ignore_label: u8,
    resize_multiple: Option<usize>,
) -> Result<Evaluation>
where
    M: ChangeDetector + Sync,
    C: CollectiveChannel,
{
    let mut aggregator = MetricAggregator::new(nclass, ignore_label);

    for batch in loader.iter() {
        let batch = batch?;
        let (_, _, h, w) = batch.image_a.dim();

        let scores = match resize_multiple {
            Some(multiple) => {
                let size = (round_to_multiple(h, multiple), round_to_multiple(w, multiple));
                let a = resize_bilinear(batch.image_a.view(), size)?;
                let b = resize_bilinear(batch.image_b.view(), size)?;
                let scores = model.predict(a.view(), b.view())?;
                resize_bilinear(scores.view(), (h, w))?
            }
            None => model.predict(batch.image_a.view(), batch.image_b.view())?,
        };

        let pred = argmax_channels(scores.view())?;
        aggregator.add_batch(pred.view(), batch.mask.view())?;
    }

    debug!(samples = loader.len(); "evaluated local shard");

    let counts = aggregator.reduce(channel).await?;
    Ok(Evaluation {
        iou_class: counts.iou_class(),
        overall_acc: counts.overall_acc(),
    })
}
