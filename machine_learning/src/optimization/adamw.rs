use std::collections::BTreeMap;

use rayon::prelude::*;

use super::Optimizer;
use crate::{
    MlErr, Result,
    arch::params::{ParamGroup, ParamGroups},
};

/// The hyperparameters shared by every group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// The per group state of `AdamW`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupState {
    pub lr: f32,
    pub step: u64,
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Vec<f32>,
}

impl GroupState {
    fn new(lr: f32, len: usize) -> Self {
        Self {
            lr,
            step: 0,
            exp_avg: vec![0.0; len],
            exp_avg_sq: vec![0.0; len],
        }
    }
}

/// The state of every group, keyed by group name.
pub type OptimizerState = BTreeMap<String, GroupState>;

/// Adam with decoupled weight decay.
#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    state: OptimizerState,
}

impl AdamW {
    /// Creates a new `AdamW`.
    ///
    /// # Arguments
    /// * `groups` - The parameter groups it will optimize.
    /// * `lrs` - The initial learning rate of each group.
    /// * `config` - The hyperparameters.
    ///
    /// # Errors
    /// Returns `MlErr::UnknownGroup` if a learning rate names a group not in `groups` or a
    /// group has no learning rate.
    pub fn new(groups: &ParamGroups, lrs: &[(&str, f32)], config: AdamWConfig) -> Result<Self> {
        let mut state = OptimizerState::new();

        for &(name, lr) in lrs {
            let group = groups.get(name)?;
            state.insert(name.to_string(), GroupState::new(lr, group.len()));
        }

        if let Some(group) = groups.iter().find(|g| !state.contains_key(g.name())) {
            return Err(MlErr::UnknownGroup(group.name().to_string()));
        }

        Ok(Self { config, state })
    }

    pub fn config(&self) -> AdamWConfig {
        self.config
    }

    fn group_state(&self, group: &str) -> Result<&GroupState> {
        self.state
            .get(group)
            .ok_or_else(|| MlErr::UnknownGroup(group.to_string()))
    }

    fn update_group(config: &AdamWConfig, state: &mut GroupState, group: &mut ParamGroup) -> Result<()> {
        if state.exp_avg.len() != group.len() {
            return Err(MlErr::SizeMismatch {
                what: "optimizer moments",
                got: state.exp_avg.len(),
                expected: group.len(),
            });
        }

        let (beta1, beta2) = config.betas;
        let lr = state.lr;
        state.step += 1;

        let bias_correction1 = 1.0 - beta1.powi(state.step as i32);
        let bias_correction2_sqrt = (1.0 - beta2.powi(state.step as i32)).sqrt();
        let step_size = lr / bias_correction1;
        let decay = 1.0 - lr * config.weight_decay;
        let eps = config.eps;

        let (params, grad) = group.split_for_update();

        params
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(state.exp_avg.par_iter_mut())
            .zip(state.exp_avg_sq.par_iter_mut())
            .for_each(|(((p, &g), m), v)| {
                *p *= decay;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;

                let denom = v.sqrt() / bias_correction2_sqrt + eps;
                *p -= step_size * *m / denom;
            });

        Ok(())
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, groups: &mut ParamGroups) -> Result<()> {
        for group in groups.iter_mut() {
            let state = self
                .state
                .get_mut(group.name())
                .ok_or_else(|| MlErr::UnknownGroup(group.name().to_string()))?;

            Self::update_group(&self.config, state, group)?;
        }

        Ok(())
    }

    fn learning_rate(&self, group: &str) -> Result<f32> {
        Ok(self.group_state(group)?.lr)
    }

    fn set_learning_rate(&mut self, group: &str, lr: f32) -> Result<()> {
        let state = self
            .state
            .get_mut(group)
            .ok_or_else(|| MlErr::UnknownGroup(group.to_string()))?;

        state.lr = lr;
        Ok(())
    }

    fn state(&self) -> OptimizerState {
        self.state.clone()
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        if state.len() != self.state.len() {
            return Err(MlErr::SizeMismatch {
                what: "optimizer groups",
                got: state.len(),
                expected: self.state.len(),
            });
        }

        for (name, group) in &state {
            let current = self.group_state(name)?;
            if current.exp_avg.len() != group.exp_avg.len()
                || current.exp_avg_sq.len() != group.exp_avg_sq.len()
            {
                return Err(MlErr::SizeMismatch {
                    what: "optimizer moments",
                    got: group.exp_avg.len(),
                    expected: current.exp_avg.len(),
                });
            }
        }

        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::params::{BACKBONE, HEAD};

    fn groups() -> ParamGroups {
        ParamGroups::new([
            ParamGroup::new(BACKBONE, vec![1.0, -1.0]),
            ParamGroup::new(HEAD, vec![0.5]),
        ])
    }

    #[test]
    fn first_step_moves_by_lr_against_the_gradient() {
        let mut groups = groups();
        let config = AdamWConfig {
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut adamw = AdamW::new(&groups, &[(BACKBONE, 0.1), (HEAD, 1.0)], config).unwrap();

        for group in groups.iter_mut() {
            group.grad_mut().fill(2.0);
        }
        adamw.step(&mut groups).unwrap();

        // With bias correction the first step is lr * sign(g).
        let backbone = groups.get(BACKBONE).unwrap().params();
        assert!((backbone[0] - 0.9).abs() < 1e-5);
        assert!((backbone[1] + 1.1).abs() < 1e-5);
        assert!((groups.get(HEAD).unwrap().params()[0] + 0.5).abs() < 1e-5);
        assert_eq!(adamw.state()[BACKBONE].step, 1);
    }

    #[test]
    fn weight_decay_shrinks_params_without_gradient() {
        let mut groups = groups();
        let mut adamw = AdamW::new(&groups, &[(BACKBONE, 0.5), (HEAD, 0.5)], AdamWConfig::default()).unwrap();

        adamw.step(&mut groups).unwrap();

        let decay = 1.0 - 0.5 * 0.01;
        assert_eq!(groups.get(BACKBONE).unwrap().params(), &[decay, -decay]);
    }

    #[test]
    fn learning_rates_are_per_group() {
        let groups = groups();
        let mut adamw = AdamW::new(&groups, &[(BACKBONE, 0.1), (HEAD, 1.0)], AdamWConfig::default()).unwrap();

        adamw.set_learning_rate(HEAD, 0.25).unwrap();

        assert_eq!(adamw.learning_rate(BACKBONE).unwrap(), 0.1);
        assert_eq!(adamw.learning_rate(HEAD).unwrap(), 0.25);
        assert!(adamw.set_learning_rate("neck", 1.0).is_err());
    }

    #[test]
    fn every_group_needs_a_learning_rate() {
        let groups = groups();
        assert!(matches!(
            AdamW::new(&groups, &[(BACKBONE, 0.1)], AdamWConfig::default()),
            Err(MlErr::UnknownGroup(name)) if name == HEAD
        ));
    }

    #[test]
    fn state_reloads_into_a_fresh_optimizer() {
        let mut groups = groups();
        let lrs = [(BACKBONE, 0.1), (HEAD, 0.2)];
        let mut trained = AdamW::new(&groups, &lrs, AdamWConfig::default()).unwrap();
        groups.get_mut(HEAD).unwrap().grad_mut()[0] = 1.0;
        trained.step(&mut groups).unwrap();

        let mut fresh = AdamW::new(&groups, &lrs, AdamWConfig::default()).unwrap();
        fresh.load_state(trained.state()).unwrap();

        assert_eq!(fresh.state(), trained.state());
    }
}
