//! The model's tensors, addressed through stable handles.
//!
//! Optimizer state is keyed by `ParamId` rather than by name or address, a
//! handle stays valid until its parameter is removed and is never reused for
//! another parameter afterwards.

use std::fmt::{self, Display};

use crate::{
    error::{MlErr, Result},
    tensor::Tensor,
};

/// A stable handle to a tensor inside a `ParamStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId {
    index: u32,
    generation: u32,
}

impl Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Whether a tensor is trained or only tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// A learnable parameter.
    Variable,
    /// A tracked tensor that isn't learned, like batch norm running statistics.
    Buffer,
}

/// The gradient attached to a parameter.
#[derive(Debug, Clone)]
pub enum Gradient {
    Dense(Tensor),
    Sparse {
        indices: Vec<usize>,
        values: Vec<f32>,
    },
}

/// A named tensor owned by the model.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    kind: VarKind,
    data: Tensor,
    grad: Option<Gradient>,
}

impl Parameter {
    /// Creates a new learnable parameter.
    pub fn new(name: impl Into<String>, data: Tensor) -> Self {
        Self {
            name: name.into(),
            kind: VarKind::Variable,
            data,
            grad: None,
        }
    }

    /// Creates a new buffer.
    pub fn buffer(name: impl Into<String>, data: Tensor) -> Self {
        Self {
            name: name.into(),
            kind: VarKind::Buffer,
            data,
            grad: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VarKind {
        self.kind
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Tensor {
        &mut self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn grad(&self) -> Option<&Gradient> {
        self.grad.as_ref()
    }

    /// Attaches a dense gradient, replacing the previous one.
    pub fn set_grad(&mut self, grad: Tensor) {
        self.grad = Some(Gradient::Dense(grad));
    }

    /// Attaches any kind of gradient, replacing the previous one.
    pub fn set_gradient(&mut self, grad: Gradient) {
        self.grad = Some(grad);
    }

    /// Detaches the gradient.
    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    /// Borrows the data mutably together with the gradient.
    pub fn split_mut(&mut self) -> (&mut Tensor, Option<&Gradient>) {
        (&mut self.data, self.grad.as_ref())
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    param: Option<Parameter>,
}

/// An arena of parameters and buffers.
///
/// Iteration follows insertion order, `replace` keeps the position of the
/// replaced entry.
#[derive(Debug, Default)]
pub struct ParamStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<ParamId>,
}

impl ParamStore {
    /// Creates a new empty `ParamStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the amount of live entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Adds a parameter at the end of the iteration order.
    ///
    /// # Returns
    /// The handle of the new parameter.
    pub fn insert(&mut self, param: Parameter) -> ParamId {
        let id = self.allocate(param);
        self.order.push(id);
        id
    }

    /// Returns whether `id` points to a live entry.
    pub fn contains(&self, id: ParamId) -> bool {
        self.get(id).is_ok()
    }

    /// Returns the parameter behind `id`.
    ///
    /// # Returns
    /// The parameter or `UnknownParam` if the handle is stale.
    pub fn get(&self, id: ParamId) -> Result<&Parameter> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.param.as_ref())
            .ok_or(MlErr::UnknownParam(id))
    }

    /// Returns the parameter behind `id` mutably.
    pub fn get_mut(&mut self, id: ParamId) -> Result<&mut Parameter> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.param.as_mut())
            .ok_or(MlErr::UnknownParam(id))
    }

    /// Finds the handle of the entry called `name`.
    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.iter()
            .find(|(_, param)| param.name() == name)
            .map(|(id, _)| id)
    }

    /// Removes the entry behind `id`, invalidating the handle.
    ///
    /// # Returns
    /// The removed parameter or `UnknownParam` if the handle is stale.
    pub fn remove(&mut self, id: ParamId) -> Result<Parameter> {
        let param = self.release(id)?;
        self.order.retain(|&other| other != id);
        Ok(param)
    }

    /// Replaces the entry behind `old` with `param`, at the same position.
    ///
    /// # Returns
    /// The handle of the new parameter and the replaced one.
    pub fn replace(&mut self, old: ParamId, param: Parameter) -> Result<(ParamId, Parameter)> {
        let pos = self
            .order
            .iter()
            .position(|&id| id == old)
            .ok_or(MlErr::UnknownParam(old))?;

        let removed = self.release(old)?;
        let new = self.allocate(param);
        self.order[pos] = new;
        Ok((new, removed))
    }

    /// Iterates every live entry in order.
    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.order
            .iter()
            .filter_map(|&id| self.get(id).ok().map(|param| (id, param)))
    }

    /// Iterates the learnable parameters in order.
    pub fn named_parameters(&self) -> impl Iterator<Item = (&str, ParamId)> {
        self.iter_kind(VarKind::Variable)
    }

    /// Iterates the buffers in order.
    pub fn named_buffers(&self) -> impl Iterator<Item = (&str, ParamId)> {
        self.iter_kind(VarKind::Buffer)
    }

    /// Detaches the gradients of every parameter.
    pub fn zero_grad(&mut self) {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.param.as_mut())
            .for_each(Parameter::zero_grad);
    }

    fn iter_kind(&self, kind: VarKind) -> impl Iterator<Item = (&str, ParamId)> {
        self.iter()
            .filter(move |(_, param)| param.kind() == kind)
            .map(|(id, param)| (param.name(), id))
    }

    fn allocate(&mut self, param: Parameter) -> ParamId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.param = Some(param);

                ParamId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    param: Some(param),
                });

                ParamId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn release(&mut self, id: ParamId) -> Result<Parameter> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(MlErr::UnknownParam(id))?;

        let param = slot.param.take().ok_or(MlErr::UnknownParam(id))?;
        slot.generation += 1;
        self.free.push(id.index);
        Ok(param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(name: &str) -> Parameter {
        Parameter::new(name, Tensor::zeros(&[2]))
    }

    #[test]
    fn removed_handles_go_stale_even_if_the_slot_is_reused() {
        let mut store = ParamStore::new();
        let a = store.insert(param("a"));
        store.remove(a).unwrap();

        let b = store.insert(param("b"));
        assert!(!store.contains(a));
        assert!(matches!(store.get(a), Err(MlErr::UnknownParam(_))));
        assert_eq!(store.get(b).unwrap().name(), "b");
    }

    #[test]
    fn replace_keeps_position() {
        let mut store = ParamStore::new();
        let a = store.insert(param("a"));
        store.insert(param("b"));
        store.insert(param("c"));

        let (a2, old) = store.replace(a, param("a2")).unwrap();
        assert_eq!(old.name(), "a");
        assert_ne!(a, a2);

        let names: Vec<_> = store.named_parameters().map(|(name, _)| name).collect();
        assert_eq!(names, ["a2", "b", "c"]);
    }

    #[test]
    fn parameters_and_buffers_are_listed_separately() {
        let mut store = ParamStore::new();
        store.insert(param("w"));
        store.insert(Parameter::buffer("running_mean", Tensor::zeros(&[2])));

        let params: Vec<_> = store.named_parameters().map(|(n, _)| n).collect();
        let buffers: Vec<_> = store.named_buffers().map(|(n, _)| n).collect();
        assert_eq!(params, ["w"]);
        assert_eq!(buffers, ["running_mean"]);
        assert!(store.find("running_mean").is_some());
    }

    #[test]
    fn zero_grad_detaches_every_gradient() {
        let mut store = ParamStore::new();
        let a = store.insert(param("a"));
        store.get_mut(a).unwrap().set_grad(Tensor::zeros(&[2]));

        store.zero_grad();
        assert!(store.get(a).unwrap().grad().is_none());
    }
}
