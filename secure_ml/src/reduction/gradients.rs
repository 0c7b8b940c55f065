use comms::Collective;
use log::{debug, warn};
use ndarray::{ArrayD, IxDyn};

use super::to_wire;
use crate::{
    error::{MlErr, Result},
    params::{Gradient, ParamId, ParamStore},
    tensor::{CrypTensor, Tensor},
};

/// Averages the gradient of every parameter across the workers of `collective`.
///
/// Parameters are visited sorted by name. A worker without a gradient for a
/// parameter contributes nothing and receives the average of the others. The
/// payload follows the variant of the parameter, which every replica shares,
/// so encrypted parameters are averaged share by share.
///
/// Workers first agree on whether any of them holds a sparse gradient, so
/// they either all average or all fail with the same error.
///
/// # Returns
/// `SparseGradient` on every worker if a gradient is sparse on any of them,
/// naming the first such parameter in name order.
pub fn allreduce_gradients<C: Collective>(collective: &C, store: &mut ParamStore) -> Result<()> {
    let mut params: Vec<(String, ParamId)> = store
        .named_parameters()
        .map(|(name, id)| (name.to_string(), id))
        .collect();
    params.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    check_dense(collective, store, &params)?;

    for (name, id) in params {
        let param = store.get(id)?;
        let shape = param.shape().to_vec();
        let grad = match param.grad() {
            Some(Gradient::Dense(grad)) => Some(grad),
            _ => None,
        };

        let averaged = if param.data().is_encrypted() {
            average_encrypted(collective, grad, &shape)?
        } else {
            average_plain(collective, grad, &shape)?
        };

        match averaged {
            Some((grad, contributors)) => {
                debug!(param = name.as_str(), contributors = contributors; "averaged gradient");
                store.get_mut(id)?.set_grad(grad);
            }
            None => debug!(param = name.as_str(); "no worker has a gradient"),
        }
    }

    Ok(())
}

/// Gathers the position of the first local sparse gradient of every worker.
fn check_dense<C: Collective>(
    collective: &C,
    store: &ParamStore,
    params: &[(String, ParamId)],
) -> Result<()> {
    let mut first_sparse = 0u64;
    for (pos, (_, id)) in params.iter().enumerate() {
        if let Some(Gradient::Sparse { .. }) = store.get(*id)?.grad() {
            first_sparse = pos as u64 + 1;
            break;
        }
    }

    let mut slots = vec![Vec::new(); collective.world_size()];
    collective.all_gather(&mut slots, &[first_sparse])?;

    let Some(pos) = slots.iter().flatten().copied().filter(|&p| p > 0).min() else {
        return Ok(());
    };

    let param = match params.get(pos as usize - 1) {
        Some((name, _)) => name.clone(),
        None => format!("#{pos}"),
    };

    if first_sparse != pos {
        warn!(param = param.as_str(); "another worker holds a sparse gradient");
    }

    Err(MlErr::SparseGradient { param })
}

fn average_plain<C: Collective>(
    collective: &C,
    grad: Option<&Tensor>,
    shape: &[usize],
) -> Result<Option<(Tensor, usize)>> {
    let local = grad.map(Tensor::to_vec).unwrap_or_default();
    let mut slots = vec![Vec::new(); collective.world_size()];
    collective.all_gather(&mut slots, &local)?;

    let len: usize = shape.iter().product();
    let mut sum = vec![0.0f32; len];
    let mut contributors = 0;

    for slot in slots.iter().filter(|slot| !slot.is_empty()) {
        if slot.len() != len {
            return Err(MlErr::ShapeMismatch {
                a: "gathered gradient",
                b: "parameter",
                got: vec![slot.len()],
                expected: shape.to_vec(),
            });
        }

        sum.iter_mut().zip(slot).for_each(|(s, g)| *s += g);
        contributors += 1;
    }

    if contributors == 0 {
        return Ok(None);
    }

    let n = contributors as f32;
    sum.iter_mut().for_each(|s| *s /= n);

    let avg = ArrayD::from_shape_vec(IxDyn(shape), sum).map_err(|_| MlErr::ShapeMismatch {
        a: "averaged gradient",
        b: "parameter",
        got: vec![len],
        expected: shape.to_vec(),
    })?;

    Ok(Some((Tensor::Plain(avg), contributors)))
}

fn average_encrypted<C: Collective>(
    collective: &C,
    grad: Option<&Tensor>,
    shape: &[usize],
) -> Result<Option<(Tensor, usize)>> {
    let local = grad.map(to_wire).unwrap_or_default();
    let mut slots = vec![Vec::new(); collective.world_size()];
    collective.all_gather(&mut slots, &local)?;

    let mut sum: Option<CrypTensor> = None;
    let mut contributors = 0;

    for slot in slots.iter().filter(|slot| !slot.is_empty()) {
        let part = CrypTensor::from_wire(slot, shape)?;

        match sum.as_mut() {
            Some(sum) => sum.add_(&part)?,
            None => sum = Some(part),
        }

        contributors += 1;
    }

    let Some(sum) = sum else {
        return Ok(None);
    };

    let mut avg = Tensor::Encrypted(sum);
    avg.mul_scalar_(1. / contributors as f32);
    Ok(Some((avg, contributors)))
}
