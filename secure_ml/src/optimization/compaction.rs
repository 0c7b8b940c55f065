//! Keeping the optimizer in sync with a model whose structure changes.
//!
//! Pruning either shrinks a parameter, in which case its state is projected
//! onto the new shape, or removes it entirely, in which case its state goes
//! with it. Group positions never change.

use log::{debug, info};

use super::adamw::{AdamState, AdamW};
use crate::{
    error::{MlErr, Result},
    params::{ParamId, ParamStore, VarKind},
    tensor::Tensor,
};

/// A parameter that was replaced by a smaller version of itself.
///
/// `mask_hook` projects an old state tensor onto a zeroed tensor shaped like
/// the new parameter, `mask` is passed through to it untouched.
pub struct CompressMask<'a, M, H> {
    pub var_old: ParamId,
    pub var_new: ParamId,
    pub var_old_name: &'a str,
    pub var_new_name: &'a str,
    pub mask: &'a M,
    pub mask_hook: H,
    pub verbose: bool,
}

/// A parameter that was removed from the model.
pub struct CompressDrop<'a> {
    pub var_old: ParamId,
    pub var_old_name: &'a str,
    pub verbose: bool,
}

/// Keeps the slices of a tensor along `axis` whose entry in `keep` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMask {
    pub axis: usize,
    pub keep: Vec<bool>,
}

impl ChannelMask {
    pub fn new(axis: usize, keep: Vec<bool>) -> Self {
        Self { axis, keep }
    }

    /// Returns the indices of the kept slices, ascending.
    pub fn kept_indices(&self) -> Vec<usize> {
        self.keep
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect()
    }

    /// Returns the amount of kept slices.
    pub fn kept(&self) -> usize {
        self.keep.iter().filter(|&&keep| keep).count()
    }
}

/// Mask hook copying the kept channels of `src` into `dst`.
pub fn select_channels(dst: &mut Tensor, src: &Tensor, mask: &ChannelMask) -> Result<()> {
    let selected = src.select(mask.axis, &mask.kept_indices())?;
    dst.assign(&selected)
}

impl AdamW {
    /// Moves the state of `var_old` to `var_new`, which takes its place in its group.
    ///
    /// The step count is kept, every moment estimate is projected through the
    /// mask hook. Nothing changes unless every projection succeeds.
    ///
    /// # Arguments
    /// * `store` - The parameters, `var_new` must already be in it.
    /// * `compress` - What was replaced and how to project its state.
    ///
    /// # Returns
    /// `ParamNotFound` if `var_old` isn't in any group, or the error of the hook.
    pub fn compress_mask<M, H>(
        &mut self,
        store: &ParamStore,
        compress: CompressMask<'_, M, H>,
    ) -> Result<()>
    where
        H: FnMut(&mut Tensor, &Tensor, &M) -> Result<()>,
    {
        let CompressMask {
            var_old,
            var_new,
            var_old_name,
            var_new_name,
            mask,
            mut mask_hook,
            verbose,
        } = compress;

        let (group, pos) = self.find(var_old, var_old_name)?;

        if var_new != var_old && self.param_ids().any(|id| id == var_new) {
            return Err(MlErr::DuplicateParam {
                param: var_new_name.to_string(),
            });
        }

        let like = store.get(var_new)?.data();
        let mut project = |old: &Tensor| -> Result<Tensor> {
            let mut new = like.zeros_like();
            mask_hook(&mut new, old, mask)?;
            Ok(new)
        };

        let new_state = match self.state.get(&var_old) {
            Some(old) => {
                let state = AdamState {
                    step: old.step,
                    exp_avg: project(&old.exp_avg)?,
                    exp_avg_sq: project(&old.exp_avg_sq)?,
                    max_exp_avg_sq: old.max_exp_avg_sq.as_ref().map(&mut project).transpose()?,
                };

                if !state.has_shape(like.shape()) {
                    return Err(MlErr::StateShapeMismatch {
                        param: var_new_name.to_string(),
                        state: state.exp_avg.shape().to_vec(),
                        expected: like.shape().to_vec(),
                    });
                }

                Some(state)
            }
            None => None,
        };

        self.state.remove(&var_old);
        if let Some(state) = new_state {
            self.state.insert(var_new, state);
        }
        self.groups[group].params[pos] = var_new;

        if verbose {
            info!("{var_old_name} -> {var_new_name}");
        }
        debug!(group = group, pos = pos; "compacted {var_old_name}");

        Ok(())
    }

    /// Forgets `var_old` and its state.
    ///
    /// The kind is read from `store`, so `var_old` must still be in it.
    ///
    /// # Returns
    /// `UnknownParam` if the store lost `var_old`, `NotAVariable` for buffers
    /// or `ParamNotFound` if it isn't in any group.
    pub fn compress_drop(&mut self, store: &ParamStore, compress: CompressDrop<'_>) -> Result<()> {
        let CompressDrop {
            var_old,
            var_old_name,
            verbose,
        } = compress;

        if store.get(var_old)?.kind() != VarKind::Variable {
            return Err(MlErr::NotAVariable {
                param: var_old_name.to_string(),
            });
        }

        let (group, pos) = self.find(var_old, var_old_name)?;
        self.state.remove(&var_old);
        self.groups[group].params.remove(pos);

        if verbose {
            info!("dropped {var_old_name}");
        }

        Ok(())
    }

    /// Returns the group of `id` and its position inside it.
    fn find(&self, id: ParamId, name: &str) -> Result<(usize, usize)> {
        self.groups
            .iter()
            .enumerate()
            .find_map(|(g, group)| {
                group
                    .params
                    .iter()
                    .position(|&other| other == id)
                    .map(|pos| (g, pos))
            })
            .ok_or_else(|| MlErr::ParamNotFound {
                param: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::{
        optimization::{AdamWConfig, Optimizer},
        params::Parameter,
    };

    struct Fixture {
        store: ParamStore,
        weight: ParamId,
        gate: ParamId,
        opt: AdamW,
    }

    fn fixture(amsgrad: bool) -> Fixture {
        let mut store = ParamStore::new();
        let weight = store.insert(Parameter::new(
            "fc.weight",
            Tensor::from(array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]].into_dyn()),
        ));
        let gate = store.insert(Parameter::new("fc.gate", Tensor::from_vec(vec![1.0; 3])));

        let config = AdamWConfig {
            amsgrad,
            ..Default::default()
        };
        let opt = AdamW::new(vec![weight, gate], config).unwrap();

        Fixture {
            store,
            weight,
            gate,
            opt,
        }
    }

    fn step(f: &mut Fixture) {
        for id in f.opt.param_ids().collect::<Vec<_>>() {
            let param = f.store.get_mut(id).unwrap();
            let grad = Tensor::from(param.data().reveal().mapv(|x| 0.1 * x));
            param.set_grad(grad);
        }

        f.opt.step(&mut f.store).unwrap();
    }

    fn shrink_weight(f: &mut Fixture, mask: &ChannelMask) -> ParamId {
        let data = f.store.get(f.weight).unwrap().data();
        let pruned = Parameter::new("fc.weight", data.select(0, &mask.kept_indices()).unwrap());
        let (new, _) = f.store.replace(f.weight, pruned).unwrap();
        new
    }

    #[test]
    fn mask_projects_state_and_keeps_step() {
        let mut f = fixture(true);
        step(&mut f);
        step(&mut f);

        let old_state = f.opt.state(f.weight).unwrap().clone();
        let mask = ChannelMask::new(0, vec![true, false, true]);
        let new = shrink_weight(&mut f, &mask);

        f.opt
            .compress_mask(
                &f.store,
                CompressMask {
                    var_old: f.weight,
                    var_new: new,
                    var_old_name: "fc.weight",
                    var_new_name: "fc.weight",
                    mask: &mask,
                    mask_hook: select_channels,
                    verbose: true,
                },
            )
            .unwrap();

        assert!(f.opt.state(f.weight).is_none());
        assert_eq!(f.opt.param_groups()[0].params(), [new, f.gate]);

        let state = f.opt.state(new).unwrap();
        assert_eq!(state.step(), 2);
        assert_eq!(state.exp_avg().shape(), &[2, 2]);

        let old = old_state.exp_avg().to_vec();
        assert_eq!(state.exp_avg().to_vec(), [old[0], old[1], old[4], old[5]]);
        assert_eq!(state.max_exp_avg_sq().unwrap().shape(), &[2, 2]);

        step(&mut f);
        assert_eq!(f.opt.state(new).unwrap().step(), 3);
    }

    #[test]
    fn mask_without_state_only_swaps_the_handle() {
        let mut f = fixture(false);
        let mask = ChannelMask::new(0, vec![false, true, true]);
        let new = shrink_weight(&mut f, &mask);

        f.opt
            .compress_mask(
                &f.store,
                CompressMask {
                    var_old: f.weight,
                    var_new: new,
                    var_old_name: "fc.weight",
                    var_new_name: "fc.weight",
                    mask: &mask,
                    mask_hook: select_channels,
                    verbose: false,
                },
            )
            .unwrap();

        assert!(f.opt.state(new).is_none());
        assert_eq!(f.opt.param_ids().next(), Some(new));
    }

    #[test]
    fn failing_hook_leaves_optimizer_untouched() {
        let mut f = fixture(false);
        step(&mut f);

        let mask = ChannelMask::new(0, vec![true, true, false]);
        let new = shrink_weight(&mut f, &mask);
        let bad_mask = ChannelMask::new(0, vec![true, false, false]);

        let err = f
            .opt
            .compress_mask(
                &f.store,
                CompressMask {
                    var_old: f.weight,
                    var_new: new,
                    var_old_name: "fc.weight",
                    var_new_name: "fc.weight",
                    mask: &bad_mask,
                    mask_hook: select_channels,
                    verbose: false,
                },
            )
            .unwrap_err();

        assert!(matches!(err, MlErr::ShapeMismatch { .. }));
        assert!(f.opt.state(f.weight).is_some());
        assert!(f.opt.state(new).is_none());
        assert_eq!(f.opt.param_groups()[0].params()[0], f.weight);
    }

    #[test]
    fn drop_removes_param_and_state() {
        let mut f = fixture(false);
        step(&mut f);

        let drop_gate = |opt: &mut AdamW, store: &ParamStore, id| {
            opt.compress_drop(
                store,
                CompressDrop {
                    var_old: id,
                    var_old_name: "fc.gate",
                    verbose: false,
                },
            )
        };

        drop_gate(&mut f.opt, &f.store, f.gate).unwrap();
        assert!(f.opt.state(f.gate).is_none());
        assert_eq!(f.opt.param_groups()[0].params(), [f.weight]);

        let err = drop_gate(&mut f.opt, &f.store, f.gate).unwrap_err();
        assert!(matches!(err, MlErr::ParamNotFound { param } if param == "fc.gate"));
    }

    #[test]
    fn drop_rejects_buffers() {
        let mut f = fixture(false);
        let mean = f.store.insert(Parameter::buffer(
            "bn.running_mean",
            Tensor::from_vec(vec![0.0; 3]),
        ));
        f.opt
            .add_param_group(vec![mean], AdamWConfig::default())
            .unwrap();

        let err = f
            .opt
            .compress_drop(
                &f.store,
                CompressDrop {
                    var_old: mean,
                    var_old_name: "bn.running_mean",
                    verbose: false,
                },
            )
            .unwrap_err();

        assert!(matches!(err, MlErr::NotAVariable { param } if param == "bn.running_mean"));
        assert_eq!(f.opt.param_ids().count(), 3);
        assert!(f.opt.param_ids().any(|id| id == mean));
    }

    #[test]
    fn drop_needs_the_param_in_the_store() {
        let mut f = fixture(false);
        f.store.remove(f.gate).unwrap();

        let err = f
            .opt
            .compress_drop(
                &f.store,
                CompressDrop {
                    var_old: f.gate,
                    var_old_name: "fc.gate",
                    verbose: false,
                },
            )
            .unwrap_err();

        assert!(matches!(err, MlErr::UnknownParam(_)));
        assert_eq!(f.opt.param_ids().count(), 2);
    }
}
