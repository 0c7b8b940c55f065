//! Cross-worker aggregation of metrics and gradients.
//!
//! Every worker must issue the same collective calls in the same order, so
//! meters and parameters are always visited sorted by name.

mod gradients;
mod method;

use std::collections::{BTreeMap, HashMap};

use comms::Collective;
use log::{debug, warn};

pub use gradients::allreduce_gradients;
pub use method::ReduceMethod;

use crate::{
    error::Result,
    meters::Meter,
    tensor::{CrypTensor, Tensor},
};

/// Reduces and flushes meters, across workers when distributed.
pub struct MeterReducer<'c, C: Collective> {
    collective: &'c C,
    distributed: bool,
}

impl<'c, C: Collective> MeterReducer<'c, C> {
    /// Creates a new `MeterReducer`.
    ///
    /// # Arguments
    /// * `collective` - The group of workers.
    /// * `distributed` - Whether to gather the values of every worker or only flush locally.
    pub fn new(collective: &'c C, distributed: bool) -> Self {
        Self {
            collective,
            distributed,
        }
    }

    /// Parses `method` and reduces the meters with it.
    ///
    /// An unsupported method fails before any collective call is issued.
    pub fn reduce_and_flush_named(
        &self,
        meters: &mut HashMap<String, Meter>,
        method: &str,
        encrypt: bool,
    ) -> Result<BTreeMap<String, Tensor>> {
        let method = method.parse()?;
        self.reduce_and_flush(meters, method, encrypt)
    }

    /// Reduces the buffered values of every scalar meter and flushes it.
    ///
    /// Meters with no values on any worker are flushed empty and left out of
    /// the result.
    ///
    /// # Arguments
    /// * `meters` - The meters, keyed by metric.
    /// * `method` - How to combine the values.
    /// * `encrypt` - Whether to secret share the values before gathering them.
    ///
    /// # Returns
    /// The reduced value of every metric.
    pub fn reduce_and_flush(
        &self,
        meters: &mut HashMap<String, Meter>,
        method: ReduceMethod,
        encrypt: bool,
    ) -> Result<BTreeMap<String, Tensor>> {
        if !self.distributed {
            return flush_scalar_meters(meters, method, encrypt);
        }

        let mut names: Vec<_> = meters.keys().cloned().collect();
        names.sort_unstable();

        let mut results = BTreeMap::new();

        for name in names {
            let Some(meter) = meters.get_mut(&name).and_then(Meter::as_scalar_mut) else {
                continue;
            };

            let local = Tensor::from_vec(meter.values());
            let gathered = if encrypt {
                self.gather_encrypted(&local)?
            } else {
                self.gather_plain(&local)?
            };

            if gathered.is_empty() {
                warn!(meter = name.as_str(); "no worker cached any value, skipping reduction");
                meter.flush(None);
                continue;
            }

            let value = method.apply(&gathered)?;
            debug!(
                meter = name.as_str(),
                method:% = method,
                values = gathered.len();
                "reduced meter"
            );

            meter.flush(Some(value.clone()));
            results.insert(name, value);
        }

        Ok(results)
    }

    fn gather_plain(&self, local: &Tensor) -> Result<Tensor> {
        let mut slots = vec![Vec::new(); self.collective.world_size()];
        self.collective.all_gather(&mut slots, &local.to_vec())?;

        Ok(Tensor::from_vec(slots.concat()))
    }

    fn gather_encrypted(&self, local: &Tensor) -> Result<Tensor> {
        let wire = to_wire(local);
        let mut slots = vec![Vec::new(); self.collective.world_size()];
        self.collective.all_gather(&mut slots, &wire)?;

        let parts = slots
            .iter()
            .map(|slot| CrypTensor::from_wire(slot, &[slot.len() / 2]))
            .collect::<Result<Vec<_>>>()?;

        Ok(Tensor::Encrypted(CrypTensor::cat(&parts)))
    }
}

/// Serializes the shares of `tensor`, secret sharing it first if needed.
pub(crate) fn to_wire(tensor: &Tensor) -> Vec<i64> {
    match tensor {
        Tensor::Encrypted(c) => c.to_wire(),
        Tensor::Plain(a) => CrypTensor::encrypt(a).to_wire(),
    }
}

/// Reduces every scalar meter on its own values only, without collectives.
///
/// # Returns
/// The reduced value of every metric that had values.
pub fn flush_scalar_meters(
    meters: &mut HashMap<String, Meter>,
    method: ReduceMethod,
    encrypt: bool,
) -> Result<BTreeMap<String, Tensor>> {
    let mut results = BTreeMap::new();

    for (name, meter) in meters.iter_mut() {
        let Some(meter) = meter.as_scalar_mut() else {
            continue;
        };

        if meter.is_empty() {
            meter.flush(None);
            continue;
        }

        let mut values = Tensor::from_vec(meter.values());
        if encrypt {
            values = values.encrypt();
        }

        let value = method.apply(&values)?;
        meter.flush(Some(value.clone()));
        results.insert(name.clone(), value);
    }

    Ok(results)
}
