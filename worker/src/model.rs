use ndarray::{Array1, Array2, ArrayD, Axis, Dimension, Ix1, Ix2};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use secure_ml::{
    MlErr, Result,
    grad_mode::is_grad_enabled,
    optimization::{AdamW, ChannelMask, CompressDrop, CompressMask, select_channels},
    params::{ParamId, ParamStore, Parameter},
    tensor::Tensor,
};

use crate::data::Batch;

/// The losses of a forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Losses {
    /// Mean squared error of the predictions.
    pub mse: f32,
    /// Half the squared norm of the weights.
    pub l2: f32,
    /// The weighted L1 norm of the gates.
    pub gate_l1: f32,
}

/// Two linear layers with a learnable gate on every hidden channel.
///
/// The gates drive channel pruning, once pruned they are folded into the
/// first layer and removed.
#[derive(Debug)]
pub struct GatedMlp {
    fc1_weight: ParamId,
    fc1_bias: ParamId,
    gate: Option<ParamId>,
    fc2_weight: ParamId,
    fc2_bias: ParamId,
}

impl GatedMlp {
    /// Creates the model's parameters inside `store`.
    ///
    /// # Arguments
    /// * `store` - Where to keep the parameters.
    /// * `dims` - The input, hidden and output sizes.
    /// * `encrypt` - Whether to secret share the parameters.
    /// * `rng` - The source of the initial weights.
    pub fn new<R: Rng>(
        store: &mut ParamStore,
        (in_features, hidden, out_features): (usize, usize, usize),
        encrypt: bool,
        rng: &mut R,
    ) -> Self {
        let mut add = |name: &str, values: ArrayD<f32>| {
            let data = Tensor::from(values);
            let data = if encrypt { data.encrypt() } else { data };
            store.insert(Parameter::new(name, data))
        };

        let fc1_weight = add("fc1.weight", init((hidden, in_features), rng).into_dyn());
        let fc1_bias = add("fc1.bias", ArrayD::zeros(vec![hidden]));
        let gate = add("gate", ArrayD::ones(vec![hidden]));
        let fc2_weight = add("fc2.weight", init((out_features, hidden), rng).into_dyn());
        let fc2_bias = add("fc2.bias", ArrayD::zeros(vec![out_features]));

        Self {
            fc1_weight,
            fc1_bias,
            gate: Some(gate),
            fc2_weight,
            fc2_bias,
        }
    }

    /// Returns the handles of every parameter, in creation order.
    pub fn params(&self) -> Vec<ParamId> {
        let mut params = vec![self.fc1_weight, self.fc1_bias];
        params.extend(self.gate);
        params.extend([self.fc2_weight, self.fc2_bias]);
        params
    }

    /// Returns the amount of hidden channels.
    pub fn hidden(&self, store: &ParamStore) -> Result<usize> {
        Ok(store.get(self.fc1_bias)?.shape()[0])
    }

    /// Returns whether the model still has its gates.
    pub fn is_gated(&self) -> bool {
        self.gate.is_some()
    }

    /// Runs the model on `batch`, attaching gradients if gradient tracking is enabled.
    ///
    /// # Arguments
    /// * `store` - The parameters.
    /// * `batch` - The samples.
    /// * `gate_l1` - Weight of the L1 penalty on the gates.
    pub fn forward_backward(
        &self,
        store: &mut ParamStore,
        batch: &Batch,
        gate_l1: f32,
    ) -> Result<Losses> {
        let w1 = matrix(store, self.fc1_weight)?;
        let b1 = vector(store, self.fc1_bias)?;
        let w2 = matrix(store, self.fc2_weight)?;
        let b2 = vector(store, self.fc2_bias)?;
        let g = match self.gate {
            Some(gate) => vector(store, gate)?,
            None => Array1::ones(b1.len()),
        };

        let x = &batch.xs;
        let z = x.dot(&w1.t()) + &b1;
        let a = &z * &g;
        let y_hat = a.dot(&w2.t()) + &b2;
        let diff = y_hat - &batch.ys;

        let losses = Losses {
            mse: diff.mapv(|d| d * d).mean().unwrap_or_default(),
            l2: 0.5 * (w1.mapv(|w| w * w).sum() + w2.mapv(|w| w * w).sum()),
            gate_l1: match self.gate {
                Some(_) => gate_l1 * g.mapv(f32::abs).sum(),
                None => 0.,
            },
        };

        if !is_grad_enabled() {
            return Ok(losses);
        }

        let dy = diff * (2. / batch.ys.len().max(1) as f32);
        let da = dy.dot(&w2);
        let dz = &da * &g;

        set_grad(store, self.fc2_weight, dy.t().dot(&a))?;
        set_grad(store, self.fc2_bias, dy.sum_axis(Axis(0)))?;
        set_grad(store, self.fc1_weight, dz.t().dot(x))?;
        set_grad(store, self.fc1_bias, dz.sum_axis(Axis(0)))?;

        if let Some(gate) = self.gate {
            let dg = (&da * &z).sum_axis(Axis(0)) + g.mapv(f32::signum) * gate_l1;
            set_grad(store, gate, dg)?;
        }

        Ok(losses)
    }

    /// Keeps the `keep` hidden channels with the largest gates and removes the gates.
    ///
    /// Both layers are compacted and the optimizer follows them, the gates are
    /// folded into the first layer beforehand so the kept channels compute the
    /// same values.
    ///
    /// # Returns
    /// The mask of kept channels, or `None` if the model was already pruned.
    pub fn prune(
        &mut self,
        store: &mut ParamStore,
        opt: &mut AdamW,
        keep: usize,
        verbose: bool,
    ) -> Result<Option<ChannelMask>> {
        let Some(gate) = self.gate else {
            return Ok(None);
        };

        let g = vector(store, gate)?;
        let mut order: Vec<usize> = (0..g.len()).collect();
        order.sort_by(|&i, &j| g[j].abs().total_cmp(&g[i].abs()).then(i.cmp(&j)));

        let mut kept = vec![false; g.len()];
        for &i in order.iter().take(keep) {
            kept[i] = true;
        }

        let rows = ChannelMask::new(0, kept.clone());
        let cols = ChannelMask::new(1, kept);
        let indices = rows.kept_indices();

        let folded_w1 = matrix(store, self.fc1_weight)? * &g.view().insert_axis(Axis(1));
        let folded_b1 = vector(store, self.fc1_bias)? * &g;
        let w2 = matrix(store, self.fc2_weight)?;

        self.fc1_weight = compact(
            store,
            opt,
            self.fc1_weight,
            folded_w1.select(Axis(0), &indices).into_dyn(),
            &rows,
            verbose,
        )?;
        self.fc1_bias = compact(
            store,
            opt,
            self.fc1_bias,
            folded_b1.select(Axis(0), &indices).into_dyn(),
            &rows,
            verbose,
        )?;
        self.fc2_weight = compact(
            store,
            opt,
            self.fc2_weight,
            w2.select(Axis(1), &indices).into_dyn(),
            &cols,
            verbose,
        )?;

        opt.compress_drop(
            store,
            CompressDrop {
                var_old: gate,
                var_old_name: "gate",
                verbose,
            },
        )?;
        store.remove(gate)?;
        self.gate = None;

        Ok(Some(rows))
    }
}

/// Replaces `old` with `values` and moves its optimizer state along.
fn compact(
    store: &mut ParamStore,
    opt: &mut AdamW,
    old: ParamId,
    values: ArrayD<f32>,
    mask: &ChannelMask,
    verbose: bool,
) -> Result<ParamId> {
    let param = store.get(old)?;
    let name = param.name().to_string();
    let data = Tensor::from(values);
    let data = if param.data().is_encrypted() {
        data.encrypt()
    } else {
        data
    };

    let (new, _) = store.replace(old, Parameter::new(name.clone(), data))?;
    opt.compress_mask(
        store,
        CompressMask {
            var_old: old,
            var_new: new,
            var_old_name: &name,
            var_new_name: &name,
            mask,
            mask_hook: select_channels,
            verbose,
        },
    )?;

    Ok(new)
}

fn init<R: Rng>((rows, cols): (usize, usize), rng: &mut R) -> Array2<f32> {
    let bound = 1. / (cols.max(1) as f32).sqrt();
    Array2::from_shape_simple_fn((rows, cols), || {
        let x: f32 = StandardNormal.sample(&mut *rng);
        bound * x
    })
}

fn plain<D: Dimension>(store: &ParamStore, id: ParamId) -> Result<ndarray::Array<f32, D>> {
    let param = store.get(id)?;
    param
        .data()
        .reveal()
        .into_dimensionality::<D>()
        .map_err(|_| MlErr::ShapeMismatch {
            a: "parameter",
            b: "layer",
            got: param.shape().to_vec(),
            expected: vec![],
        })
}

fn matrix(store: &ParamStore, id: ParamId) -> Result<Array2<f32>> {
    plain::<Ix2>(store, id)
}

fn vector(store: &ParamStore, id: ParamId) -> Result<Array1<f32>> {
    plain::<Ix1>(store, id)
}

fn set_grad<D: Dimension>(
    store: &mut ParamStore,
    id: ParamId,
    grad: ndarray::Array<f32, D>,
) -> Result<()> {
    let param = store.get_mut(id)?;
    let grad = Tensor::from(grad.into_dyn());
    let grad = if param.data().is_encrypted() {
        grad.encrypt()
    } else {
        grad
    };

    param.set_grad(grad);
    Ok(())
}
