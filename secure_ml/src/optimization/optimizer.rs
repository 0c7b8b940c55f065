use crate::{error::Result, params::ParamStore};

/// An algorithm that updates the parameters of a model from their gradients.
pub trait Optimizer {
    /// Makes a single optimization step over every parameter it tracks that has a gradient.
    ///
    /// # Arguments
    /// * `store` - The parameters, updated in place.
    fn step(&mut self, store: &mut ParamStore) -> Result<()>;

    /// Detaches the gradients of every parameter it tracks.
    fn zero_grad(&self, store: &mut ParamStore) -> Result<()>;
}
