use std::{fs, io, path::Path};

use log::info;
use machine_learning::arch::{BackboneSize, ChangeDetector, SiameseNet, params::BACKBONE};
use ndarray::{Array4, ArrayView4};
use safetensors::SafeTensors;

use crate::{
    checkpoint,
    config::TrainConfig,
    dist::CollectiveChannel,
    error::{Result, WorkerErr},
};

/// A model replica kept identical to every other worker's.
///
/// Replicas start from the main rank's parameters and apply the same averaged gradient
/// on every step, so they never drift apart.
pub struct ReplicatedModel<M: ChangeDetector> {
    inner: M,
    world_size: usize,
}

impl<M: ChangeDetector> ReplicatedModel<M> {
    /// Wraps `model`, overwriting its parameters with the main rank's.
    ///
    /// # Arguments
    /// * `model` - This worker's freshly built model.
    /// * `channel` - The run's collectives, one reduction per parameter group is issued.
    ///
    /// # Returns
    /// A new `ReplicatedModel` instance.
    pub async fn new<C: CollectiveChannel>(mut model: M, channel: &mut C) -> Result<Self> {
        let main = channel.rank() == 0;

        // A sum where every other rank contributes zeros is a broadcast.
        for group in model.params_mut().iter_mut() {
            let params = group.params_mut();
            if !main {
                params.fill(0.0);
            }

            channel.all_reduce_sum(params).await?;
        }

        Ok(Self {
            inner: model,
            world_size: channel.world_size(),
        })
    }

    pub fn forward(&mut self, a: ArrayView4<f32>, b: ArrayView4<f32>) -> Result<Array4<f32>> {
        Ok(self.inner.forward(a, b)?)
    }

    /// Runs the local backward pass then replaces every gradient with its mean over the
    /// workers.
    pub async fn backward<C: CollectiveChannel>(
        &mut self,
        d_scores: ArrayView4<'_, f32>,
        channel: &mut C,
    ) -> Result<()> {
        self.inner.backward(d_scores)?;

        let scale = 1.0 / self.world_size as f32;
        for group in self.inner.params_mut().iter_mut() {
            let grad = group.grad_mut();
            channel.all_reduce_sum(grad).await?;

            if self.world_size > 1 {
                grad.iter_mut().for_each(|g| *g *= scale);
            }
        }

        Ok(())
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.inner
    }
}

/// Builds the model described by `config` with its pretrained backbone loaded.
///
/// # Errors
/// Returns `WorkerErr::Setup` if the pretrained weights are missing or don't fit the
/// backbone.
pub fn build_model(config: &TrainConfig) -> Result<SiameseNet> {
    let size = BackboneSize::from_backbone(&config.backbone)?;
    let mut model = SiameseNet::new(config.in_channels, size, config.nclass, config.seed)?;

    let path = config.pretrained_path();
    let backbone = load_pretrained(&path)?;
    model
        .load_backbone(&backbone)
        .map_err(|e| WorkerErr::setup(format!("pretrained weights {}: {e}", path.display())))?;

    info!("Total params: {:.1}M", count_params(&model) as f64 / 1e6);
    Ok(model)
}

pub fn count_params<M: ChangeDetector>(model: &M) -> usize {
    model.params().num_params()
}

/// Reads the flat backbone tensor of a pretrained weights file.
pub fn load_pretrained(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
            WorkerErr::setup(format!("pretrained weights not found at {}", path.display()))
        }
        _ => WorkerErr::setup(format!("can't read {}: {e}", path.display())),
    })?;

    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| WorkerErr::setup(format!("{} is not a safetensors file: {e}", path.display())))?;

    checkpoint::read_f32(&tensors, BACKBONE)
        .map_err(|detail| WorkerErr::setup(format!("{}: {detail}", path.display())))
}
