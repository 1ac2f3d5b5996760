use rayon::prelude::*;

use crate::{MlErr, Result};

/// Name of the parameter group holding the shared image encoder.
pub const BACKBONE: &str = "backbone";

/// Name of the parameter group holding the task head.
pub const HEAD: &str = "head";

/// A detached copy of every group's parameters, in group order.
pub type ParamSnapshot = Vec<(String, Vec<f32>)>;

/// A named, flat slice of trainable parameters along with its gradient buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    name: String,
    params: Vec<f32>,
    grad: Vec<f32>,
}

impl ParamGroup {
    /// Creates a new `ParamGroup` with a zeroed gradient.
    ///
    /// # Arguments
    /// * `name` - The group's name, optimizers address their rates by it.
    /// * `params` - The initial parameters.
    ///
    /// # Returns
    /// A new `ParamGroup` instance.
    pub fn new(name: impl Into<String>, params: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            grad: vec![0.0; params.len()],
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    /// Gives read access to the parameters and write access to the gradient at once, as
    /// needed by a backward pass.
    pub fn split_for_backward(&mut self) -> (&[f32], &mut [f32]) {
        (&self.params, &mut self.grad)
    }

    /// Gives write access to the parameters and read access to the gradient at once, as
    /// needed by an optimizer step.
    pub fn split_for_update(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.params, &self.grad)
    }

    /// Overwrites the parameters with `values`.
    ///
    /// # Errors
    /// Returns `MlErr::SizeMismatch` if the lengths differ.
    pub fn load(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(MlErr::SizeMismatch {
                what: "parameter group",
                got: values.len(),
                expected: self.params.len(),
            });
        }

        self.params.copy_from_slice(values);
        Ok(())
    }

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }
}

/// The full set of trainable parameters of a model, split in named groups so that
/// each group can be optimized with its own learning rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroups {
    groups: Vec<ParamGroup>,
}

impl ParamGroups {
    /// Creates a new `ParamGroups`.
    ///
    /// # Arguments
    /// * `groups` - The groups in a fixed order, every traversal follows it.
    pub fn new<I>(groups: I) -> Self
    where
        I: IntoIterator<Item = ParamGroup>,
    {
        Self {
            groups: groups.into_iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&ParamGroup> {
        self.groups
            .iter()
            .find(|group| group.name == name)
            .ok_or_else(|| MlErr::UnknownGroup(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut ParamGroup> {
        self.groups
            .iter_mut()
            .find(|group| group.name == name)
            .ok_or_else(|| MlErr::UnknownGroup(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamGroup> {
        self.groups.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ParamGroup> {
        self.groups.iter_mut()
    }

    /// Returns the total amount of parameters across all groups.
    pub fn num_params(&self) -> usize {
        self.groups.iter().map(ParamGroup::len).sum()
    }

    /// Zeros out the gradients of every group.
    pub fn zero_grad(&mut self) {
        self.groups
            .par_iter_mut()
            .for_each(|group| group.grad.fill(0.0));
    }

    /// Copies every group's parameters out.
    pub fn snapshot(&self) -> ParamSnapshot {
        self.groups
            .iter()
            .map(|group| (group.name.clone(), group.params.clone()))
            .collect()
    }

    /// Restores the parameters from a snapshot produced by a model of the same architecture.
    ///
    /// # Errors
    /// Returns an error if a group is missing on either side or its size differs.
    pub fn restore(&mut self, snapshot: &[(String, Vec<f32>)]) -> Result<()> {
        if snapshot.len() != self.groups.len() {
            return Err(MlErr::SizeMismatch {
                what: "parameter groups",
                got: snapshot.len(),
                expected: self.groups.len(),
            });
        }

        for (name, values) in snapshot {
            self.get_mut(name)?.load(values)?;
        }

        Ok(())
    }
}
