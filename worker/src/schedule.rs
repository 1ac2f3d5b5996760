use machine_learning::{
    arch::params::{BACKBONE, HEAD},
    optimization::Optimizer,
};

use crate::error::Result;

/// The exponent of the polynomial decay.
pub const POLY_POWER: f64 = 0.9;

/// Polynomially decays `base_lr` from `current_iter = 0` down to zero at `total_iters`.
///
/// The progress ratio is clamped to `[0, 1]`, so the rate never turns negative, and a
/// schedule without iterations yields zero.
pub fn poly_lr(base_lr: f64, current_iter: u64, total_iters: u64, power: f64) -> f64 {
    if total_iters == 0 {
        return 0.0;
    }

    let progress = (current_iter as f64 / total_iters as f64).clamp(0.0, 1.0);
    base_lr * (1.0 - progress).powf(power)
}

/// The learning rate policy of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub base_lr: f64,
    pub lr_multi: f64,
    pub total_iters: u64,
    pub power: f64,
}

impl LrSchedule {
    pub fn new(base_lr: f64, lr_multi: f64, total_iters: u64) -> Self {
        Self {
            base_lr,
            lr_multi,
            total_iters,
            power: POLY_POWER,
        }
    }

    /// The backbone rate after `iter` global iterations.
    pub fn lr(&self, iter: u64) -> f64 {
        poly_lr(self.base_lr, iter, self.total_iters, self.power)
    }

    /// Sets the backbone group to `lr(iter)` and the head group to `lr(iter) * lr_multi`.
    ///
    /// # Returns
    /// The backbone rate.
    pub fn apply<O: Optimizer>(&self, optimizer: &mut O, iter: u64) -> Result<f64> {
        let lr = self.lr(iter);
        optimizer.set_learning_rate(BACKBONE, lr as f32)?;
        optimizer.set_learning_rate(HEAD, (lr * self.lr_multi) as f32)?;
        Ok(lr)
    }
}
