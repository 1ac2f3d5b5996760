use super::OptimizerState;
use crate::{Result, arch::params::ParamGroups};

/// An optimization algorithm over named parameter groups, each with its own learning rate.
pub trait Optimizer {
    /// Updates every group's parameters from its gradient.
    fn step(&mut self, groups: &mut ParamGroups) -> Result<()>;

    fn learning_rate(&self, group: &str) -> Result<f32>;

    fn set_learning_rate(&mut self, group: &str, lr: f32) -> Result<()>;

    /// Copies out the full optimizer state, learning rates included.
    fn state(&self) -> OptimizerState;

    /// Replaces the optimizer state with one taken from an optimizer over the same groups.
    fn load_state(&mut self, state: OptimizerState) -> Result<()>;
}
