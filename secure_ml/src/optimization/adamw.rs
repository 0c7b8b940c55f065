use std::collections::{HashMap, HashSet};

use log::debug;
use serde::Deserialize;

use super::Optimizer;
use crate::{
    error::{MlErr, Result},
    grad_mode::{EnableGradGuard, NoGradGuard},
    params::{Gradient, ParamId, ParamStore},
    tensor::Tensor,
};

/// Fractional bits of encrypted moment estimates.
///
/// Squared gradients fall far below the resolution of the parameters, the
/// range left still holds squared gradients of magnitude up to about 700.
const MOMENT_FRAC_BITS: u32 = 44;

/// The hyperparameters of a parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdamWConfig {
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    pub amsgrad: bool,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 1e-2,
            amsgrad: false,
        }
    }
}

impl AdamWConfig {
    /// Checks that every hyperparameter is in range, values are never clamped.
    pub fn validate(&self) -> Result<()> {
        if !(self.lr >= 0.) {
            return Err(MlErr::InvalidLearningRate(self.lr));
        }

        if !(self.eps >= 0.) {
            return Err(MlErr::InvalidEpsilon(self.eps));
        }

        for (index, value) in [self.betas.0, self.betas.1].into_iter().enumerate() {
            if !(0.0..1.0).contains(&value) {
                return Err(MlErr::InvalidBeta { index, value });
            }
        }

        if !(self.weight_decay >= 0.) {
            return Err(MlErr::InvalidWeightDecay(self.weight_decay));
        }

        Ok(())
    }
}

/// An ordered set of parameters sharing hyperparameters.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub(super) params: Vec<ParamId>,
    config: AdamWConfig,
}

impl ParamGroup {
    pub fn params(&self) -> &[ParamId] {
        &self.params
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Changes the learning rate of this group.
    pub fn set_lr(&mut self, lr: f32) -> Result<()> {
        AdamWConfig { lr, ..self.config }.validate()?;
        self.config.lr = lr;
        Ok(())
    }
}

/// The moment estimates of a single parameter.
#[derive(Debug, Clone)]
pub struct AdamState {
    pub(super) step: u64,
    pub(super) exp_avg: Tensor,
    pub(super) exp_avg_sq: Tensor,
    pub(super) max_exp_avg_sq: Option<Tensor>,
}

impl AdamState {
    fn new(like: &Tensor, amsgrad: bool) -> Self {
        let zeros = || like.zeros_like().with_frac_bits(MOMENT_FRAC_BITS);

        Self {
            step: 0,
            exp_avg: zeros(),
            exp_avg_sq: zeros(),
            max_exp_avg_sq: amsgrad.then(zeros),
        }
    }

    /// Returns the amount of steps taken for this parameter.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn exp_avg(&self) -> &Tensor {
        &self.exp_avg
    }

    pub fn exp_avg_sq(&self) -> &Tensor {
        &self.exp_avg_sq
    }

    pub fn max_exp_avg_sq(&self) -> Option<&Tensor> {
        self.max_exp_avg_sq.as_ref()
    }

    /// Returns whether every moment estimate has `shape`.
    pub(super) fn has_shape(&self, shape: &[usize]) -> bool {
        self.exp_avg.shape() == shape
            && self.exp_avg_sq.shape() == shape
            && self
                .max_exp_avg_sq
                .as_ref()
                .is_none_or(|max| max.shape() == shape)
    }
}

/// Adam with decoupled weight decay and optional AMSGrad.
///
/// The state of a parameter is created on its first step and is keyed by its
/// handle, so it follows the parameter through compaction.
#[derive(Debug)]
pub struct AdamW {
    pub(super) groups: Vec<ParamGroup>,
    pub(super) state: HashMap<ParamId, AdamState>,
}

impl AdamW {
    /// Creates a new `AdamW` with a single parameter group.
    ///
    /// # Arguments
    /// * `params` - The parameters to optimize.
    /// * `config` - Their hyperparameters.
    ///
    /// # Returns
    /// The optimizer or a configuration error naming the offending value.
    pub fn new(params: Vec<ParamId>, config: AdamWConfig) -> Result<Self> {
        let mut optimizer = Self {
            groups: Vec::new(),
            state: HashMap::new(),
        };

        optimizer.add_param_group(params, config)?;
        Ok(optimizer)
    }

    /// Appends a parameter group, validated like the first one.
    ///
    /// # Returns
    /// A configuration error or `DuplicateParam` if a parameter is already tracked.
    pub fn add_param_group(&mut self, params: Vec<ParamId>, config: AdamWConfig) -> Result<()> {
        config.validate()?;

        let mut seen: HashSet<ParamId> = self.param_ids().collect();
        for &id in &params {
            if !seen.insert(id) {
                return Err(MlErr::DuplicateParam {
                    param: id.to_string(),
                });
            }
        }

        self.groups.push(ParamGroup { params, config });
        Ok(())
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Iterates every tracked parameter, in group order.
    pub fn param_ids(&self) -> impl Iterator<Item = ParamId> + '_ {
        self.groups.iter().flat_map(|group| group.params.iter().copied())
    }

    /// Returns the state of `id`, if it took any step.
    pub fn state(&self, id: ParamId) -> Option<&AdamState> {
        self.state.get(&id)
    }

    /// Changes the learning rate of every group.
    pub fn set_lr(&mut self, lr: f32) -> Result<()> {
        self.groups.iter_mut().try_for_each(|group| group.set_lr(lr))
    }

    /// Re-evaluates the model through `closure` and then makes a step.
    ///
    /// The closure runs with gradient tracking enabled for as long as it keeps
    /// the guard it receives.
    ///
    /// # Returns
    /// The loss returned by the closure.
    pub fn step_with_closure<F, L>(&mut self, store: &mut ParamStore, closure: F) -> Result<L>
    where
        F: FnOnce(EnableGradGuard, &mut ParamStore) -> Result<L>,
    {
        let loss = {
            let _no_grad = NoGradGuard::new();
            closure(EnableGradGuard::new(), store)?
        };

        self.step(store)?;
        Ok(loss)
    }

    /// Checks every gradient and state entry before anything is updated.
    fn check(&self, store: &ParamStore) -> Result<()> {
        for &id in self.groups.iter().flat_map(|group| &group.params) {
            let param = store.get(id)?;

            let grad = match param.grad() {
                None => continue,
                Some(Gradient::Sparse { .. }) => {
                    return Err(MlErr::SparseGradient {
                        param: param.name().to_string(),
                    });
                }
                Some(Gradient::Dense(grad)) => grad,
            };

            if grad.shape() != param.shape() {
                return Err(MlErr::ShapeMismatch {
                    a: "gradient",
                    b: "parameter",
                    got: grad.shape().to_vec(),
                    expected: param.shape().to_vec(),
                });
            }

            if let Some(state) = self.state.get(&id) {
                if !state.has_shape(param.shape()) {
                    return Err(MlErr::StateShapeMismatch {
                        param: param.name().to_string(),
                        state: state.exp_avg.shape().to_vec(),
                        expected: param.shape().to_vec(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Optimizer for AdamW {
    /// Updates every parameter with a gradient.
    ///
    /// Nothing is modified if any gradient is sparse or any shape doesn't match.
    fn step(&mut self, store: &mut ParamStore) -> Result<()> {
        let _no_grad = NoGradGuard::new();
        self.check(store)?;

        for group in &self.groups {
            let AdamWConfig {
                lr,
                betas: (beta1, beta2),
                eps,
                weight_decay,
                amsgrad,
            } = group.config;

            for &id in &group.params {
                let (data, grad) = store.get_mut(id)?.split_mut();
                let Some(Gradient::Dense(grad)) = grad else {
                    continue;
                };

                data.mul_scalar_(1. - lr * weight_decay);

                let state = self
                    .state
                    .entry(id)
                    .or_insert_with(|| AdamState::new(&*data, amsgrad));

                state.step += 1;
                let bias_correction1 = 1. - beta1.powf(state.step as f32);
                let bias_correction2 = 1. - beta2.powf(state.step as f32);

                state.exp_avg.mul_scalar_(beta1);
                state.exp_avg.add_scaled_(grad, 1. - beta1)?;

                state.exp_avg_sq.mul_scalar_(beta2);
                state.exp_avg_sq.addcmul_(grad, grad, 1. - beta2)?;

                let second_moment = if amsgrad {
                    let max_exp_avg_sq = state
                        .max_exp_avg_sq
                        .get_or_insert_with(|| state.exp_avg_sq.zeros_like());
                    max_exp_avg_sq.maximum_(&state.exp_avg_sq)?;
                    &*max_exp_avg_sq
                } else {
                    &state.exp_avg_sq
                };

                data.addcdiv_sqrt_(
                    &state.exp_avg,
                    second_moment,
                    -lr / bias_correction1,
                    bias_correction2.sqrt(),
                    eps,
                )?;
            }
        }

        debug!(params = self.state.len(); "optimizer step done");
        Ok(())
    }

    fn zero_grad(&self, store: &mut ParamStore) -> Result<()> {
        for id in self.param_ids() {
            store.get_mut(id)?.zero_grad();
        }

        Ok(())
    }
}
