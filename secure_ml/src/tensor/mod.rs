//! The numeric backend shared by plaintext and encrypted training.
//!
//! `Tensor` offers the same operations for both of its variants, an operation
//! with at least one encrypted operand yields an encrypted result.

mod crypten;

use ndarray::{Array1, ArrayD, Axis, IxDyn, Zip};

pub use crypten::{CrypTensor, FRAC_BITS, decode, encode};

use crate::error::{MlErr, Result};

/// A plaintext or secret shared tensor.
#[derive(Debug, Clone)]
pub enum Tensor {
    Plain(ArrayD<f32>),
    Encrypted(CrypTensor),
}

impl Tensor {
    /// Creates a one dimensional plaintext tensor.
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self::Plain(Array1::from_vec(values).into_dyn())
    }

    /// Creates a zero dimensional plaintext tensor.
    pub fn scalar(value: f32) -> Self {
        Self::Plain(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Creates a plaintext tensor of zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::Plain(ArrayD::zeros(IxDyn(shape)))
    }

    /// Returns a secret shared copy of this tensor.
    pub fn encrypt(&self) -> Self {
        match self {
            Tensor::Plain(a) => Tensor::Encrypted(CrypTensor::encrypt(a)),
            Tensor::Encrypted(_) => self.clone(),
        }
    }

    /// Returns a copy kept with `frac_bits` fractional bits if secret shared.
    ///
    /// Plaintext tensors are returned unchanged.
    pub fn with_frac_bits(&self, frac_bits: u32) -> Self {
        match self {
            Tensor::Plain(_) => self.clone(),
            Tensor::Encrypted(c) => Tensor::Encrypted(c.with_frac_bits(frac_bits)),
        }
    }

    /// Returns whether the tensor is secret shared.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Tensor::Encrypted(_))
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::Plain(a) => a.shape(),
            Tensor::Encrypted(c) => c.shape(),
        }
    }

    /// Returns the amount of elements in the tensor.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns whether the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a tensor of zeros with the same shape and variant.
    pub fn zeros_like(&self) -> Self {
        match self {
            Tensor::Plain(a) => Tensor::Plain(ArrayD::zeros(a.raw_dim())),
            Tensor::Encrypted(c) => Tensor::Encrypted(c.reshare(&ArrayD::zeros(c.shape()))),
        }
    }

    /// Returns the plaintext values, revealing them if needed.
    pub fn reveal(&self) -> ArrayD<f32> {
        match self {
            Tensor::Plain(a) => a.clone(),
            Tensor::Encrypted(c) => c.reveal(),
        }
    }

    /// Returns the plaintext values in logical order.
    pub fn to_vec(&self) -> Vec<f32> {
        match self {
            Tensor::Plain(a) => a.iter().copied().collect(),
            Tensor::Encrypted(c) => c.reveal().iter().copied().collect(),
        }
    }

    /// Returns the single value of a one element tensor.
    pub fn item(&self) -> Result<f32> {
        let values = self.to_vec();

        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(MlErr::ShapeMismatch {
                a: "tensor",
                b: "scalar",
                got: self.shape().to_vec(),
                expected: vec![],
            }),
        }
    }

    /// Multiplies every element by `s`.
    pub fn mul_scalar_(&mut self, s: f32) {
        self.map_inplace(|x| x * s);
    }

    /// Computes `self += alpha * other`.
    pub fn add_scaled_(&mut self, other: &Tensor, alpha: f32) -> Result<()> {
        if let (Tensor::Encrypted(a), Tensor::Encrypted(b)) = (&mut *self, other) {
            if alpha == 1. {
                return a.add_(b);
            }
        }

        self.zip_map_(other, |x, y| x + alpha * y)
    }

    /// Computes `self += value * a * b` elementwise.
    pub fn addcmul_(&mut self, a: &Tensor, b: &Tensor, value: f32) -> Result<()> {
        self.zip3_map_(a, b, |x, a, b| x + value * a * b)
    }

    /// Computes `self += value * num / (sqrt(sq) / div + eps)` elementwise.
    ///
    /// The whole expression is evaluated before re-encoding, so a denominator
    /// below the fixed point resolution never rounds to zero.
    pub fn addcdiv_sqrt_(
        &mut self,
        num: &Tensor,
        sq: &Tensor,
        value: f32,
        div: f32,
        eps: f32,
    ) -> Result<()> {
        self.zip3_map_(num, sq, |x, n, s| x + value * n / (s.sqrt() / div + eps))
    }

    /// Keeps the elementwise maximum of `self` and `other`.
    pub fn maximum_(&mut self, other: &Tensor) -> Result<()> {
        self.zip_map_(other, f32::max)
    }

    /// Overwrites the values with the ones of `src`, keeping this tensor's variant.
    pub fn assign(&mut self, src: &Tensor) -> Result<()> {
        self.check_shape(src, "assignment source")?;

        let value = if self.is_encrypted() {
            src.encrypt()
        } else {
            Tensor::Plain(src.reveal())
        };

        *self = value;

        Ok(())
    }

    /// Selects `indices` along `axis`.
    ///
    /// # Returns
    /// A new tensor of the same variant, or a `ShapeMismatch` if the axis or any index is out of bounds.
    pub fn select(&self, axis: usize, indices: &[usize]) -> Result<Tensor> {
        let shape = self.shape();
        let in_bounds = axis < shape.len() && indices.iter().all(|&i| i < shape[axis]);

        if !in_bounds {
            return Err(MlErr::ShapeMismatch {
                a: "selection",
                b: "tensor",
                got: indices.to_vec(),
                expected: shape.to_vec(),
            });
        }

        let selected = match self {
            Tensor::Plain(a) => Tensor::Plain(a.select(Axis(axis), indices)),
            Tensor::Encrypted(c) => Tensor::Encrypted(c.select(axis, indices)),
        };

        Ok(selected)
    }

    /// Flattens and concatenates `tensors`.
    ///
    /// The result is encrypted if any of the inputs is.
    pub fn cat(tensors: &[Tensor]) -> Tensor {
        if let Some(parts) = tensors
            .iter()
            .map(|t| match t {
                Tensor::Encrypted(c) => Some(c.clone()),
                Tensor::Plain(_) => None,
            })
            .collect::<Option<Vec<_>>>()
        {
            if !parts.is_empty() {
                return Tensor::Encrypted(CrypTensor::cat(&parts));
            }
        }

        let values: Vec<f32> = tensors.iter().flat_map(Tensor::to_vec).collect();
        let cat = Tensor::from_vec(values);

        if tensors.iter().any(Tensor::is_encrypted) {
            cat.encrypt()
        } else {
            cat
        }
    }

    /// Returns the mean of all the elements as a zero dimensional tensor.
    pub fn mean(&self) -> Result<Tensor> {
        let len = self.len() as f32;
        self.fold(|values| values.iter().sum::<f32>() / len)
    }

    /// Returns the sum of all the elements as a zero dimensional tensor.
    pub fn sum(&self) -> Result<Tensor> {
        self.fold(|values| values.iter().sum())
    }

    /// Returns the maximum element as a zero dimensional tensor.
    pub fn max(&self) -> Result<Tensor> {
        self.fold(|values| values.iter().copied().fold(f32::NEG_INFINITY, f32::max))
    }

    /// Returns the minimum element as a zero dimensional tensor.
    pub fn min(&self) -> Result<Tensor> {
        self.fold(|values| values.iter().copied().fold(f32::INFINITY, f32::min))
    }

    fn fold<F>(&self, f: F) -> Result<Tensor>
    where
        F: FnOnce(&[f32]) -> f32,
    {
        if self.is_empty() {
            return Err(MlErr::EmptyTensor);
        }

        let scalar = Tensor::scalar(f(&self.to_vec()));

        Ok(match self {
            Tensor::Plain(_) => scalar,
            Tensor::Encrypted(_) => scalar.encrypt(),
        })
    }

    fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        match self {
            Tensor::Plain(a) => {
                let mut out = a.clone();
                out.par_mapv_inplace(f);
                Tensor::Plain(out)
            }
            Tensor::Encrypted(c) => {
                let mut plain = c.reveal();
                plain.par_mapv_inplace(f);
                Tensor::Encrypted(c.reshare(&plain))
            }
        }
    }

    fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        match self {
            Tensor::Plain(a) => a.par_mapv_inplace(f),
            Tensor::Encrypted(_) => *self = self.map(f),
        }
    }

    /// Applies `f` to every element and the matching ones of `a` and `b`, re-encoding once.
    fn zip3_map_<F>(&mut self, a: &Tensor, b: &Tensor, f: F) -> Result<()>
    where
        F: Fn(f32, f32, f32) -> f32 + Sync + Send,
    {
        self.check_shape(a, "first operand")?;
        self.check_shape(b, "second operand")?;

        let encrypted = a.is_encrypted() || b.is_encrypted();
        let (a, b) = (a.reveal(), b.reveal());
        let apply = |x: &mut f32, &a: &f32, &b: &f32| *x = f(*x, a, b);

        match self {
            Tensor::Plain(plain) => {
                Zip::from(&mut *plain).and(&a).and(&b).par_for_each(apply);
                if encrypted {
                    *self = self.encrypt();
                }
            }
            Tensor::Encrypted(c) => {
                let mut plain = c.reveal();
                Zip::from(&mut plain).and(&a).and(&b).par_for_each(apply);
                *c = c.reshare(&plain);
            }
        }

        Ok(())
    }

    fn zip_map_<F>(&mut self, other: &Tensor, f: F) -> Result<()>
    where
        F: Fn(f32, f32) -> f32 + Sync + Send,
    {
        self.check_shape(other, "operand")?;

        match (&mut *self, other) {
            (Tensor::Plain(a), Tensor::Plain(b)) => {
                Zip::from(a).and(b).par_for_each(|x, &y| *x = f(*x, y));
            }
            (lhs, rhs) => {
                let mut plain = lhs.reveal();
                Zip::from(&mut plain)
                    .and(&rhs.reveal())
                    .par_for_each(|x, &y| *x = f(*x, y));

                *lhs = match lhs {
                    Tensor::Encrypted(c) => Tensor::Encrypted(c.reshare(&plain)),
                    Tensor::Plain(_) => Tensor::Encrypted(CrypTensor::encrypt(&plain)),
                };
            }
        }

        Ok(())
    }

    fn check_shape(&self, other: &Tensor, what: &'static str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(MlErr::ShapeMismatch {
                a: "tensor",
                b: what,
                got: other.shape().to_vec(),
                expected: self.shape().to_vec(),
            });
        }

        Ok(())
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(value: ArrayD<f32>) -> Self {
        Self::Plain(value)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn reductions_match_between_variants() {
        let plain = Tensor::from_vec(vec![1.0, 3.0, 1.0, 3.0]);
        let enc = plain.encrypt();

        for (p, e) in [
            (plain.mean(), enc.mean()),
            (plain.sum(), enc.sum()),
            (plain.max(), enc.max()),
            (plain.min(), enc.min()),
        ] {
            let (p, e) = (p.unwrap(), e.unwrap());
            assert!(!p.is_encrypted());
            assert!(e.is_encrypted());
            assert!(close(p.item().unwrap(), e.item().unwrap()));
        }

        assert_eq!(plain.mean().unwrap().item().unwrap(), 2.0);
        assert_eq!(plain.sum().unwrap().item().unwrap(), 8.0);
    }

    #[test]
    fn reducing_empty_tensor_fails() {
        let empty = Tensor::from_vec(vec![]);
        assert!(matches!(empty.mean(), Err(MlErr::EmptyTensor)));
        assert!(matches!(empty.encrypt().max(), Err(MlErr::EmptyTensor)));
    }

    #[test]
    fn mixed_operands_yield_encrypted_results() {
        let mut enc = Tensor::from_vec(vec![1.0, 2.0]).encrypt();
        let plain = Tensor::from_vec(vec![10.0, 20.0]);

        enc.add_scaled_(&plain, 0.5).unwrap();
        assert!(enc.is_encrypted());
        assert_eq!(enc.to_vec(), [6.0, 12.0]);

        let mut plain = plain;
        plain.maximum_(&Tensor::from_vec(vec![15.0, 15.0])).unwrap();
        assert_eq!(plain.to_vec(), [15.0, 20.0]);
    }

    #[test]
    fn binary_ops_reject_shape_mismatch() {
        let mut a = Tensor::zeros(&[2, 2]);
        let b = Tensor::zeros(&[4]);
        assert!(matches!(
            a.add_scaled_(&b, 1.0),
            Err(MlErr::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn select_keeps_variant_and_checks_bounds() {
        let t = Tensor::from(array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]].into_dyn());

        let rows = t.select(0, &[0, 2]).unwrap();
        assert_eq!(rows.shape(), &[2, 2]);
        assert_eq!(rows.to_vec(), [1.0, 2.0, 5.0, 6.0]);

        let enc_rows = t.encrypt().select(0, &[1]).unwrap();
        assert!(enc_rows.is_encrypted());
        assert_eq!(enc_rows.to_vec(), [3.0, 4.0]);

        assert!(t.select(0, &[3]).is_err());
        assert!(t.select(2, &[0]).is_err());
    }

    #[test]
    fn assign_keeps_destination_variant() {
        let mut dst = Tensor::zeros(&[2]).encrypt();
        dst.assign(&Tensor::from_vec(vec![1.0, -1.0])).unwrap();

        assert!(dst.is_encrypted());
        assert_eq!(dst.to_vec(), [1.0, -1.0]);
    }

    #[test]
    fn fused_division_survives_tiny_denominators() {
        let num = Tensor::from_vec(vec![1e-5, 0.0, -2e-6]);
        let sq = Tensor::from_vec(vec![1e-11, 0.0, 4e-12]);
        let fine = |t: &Tensor| Tensor::Encrypted(CrypTensor::encrypt_with(&t.reveal(), 44));
        let (div, eps) = (1e-3f32.sqrt(), 1e-8);

        let mut plain = Tensor::from_vec(vec![1.0, 1.0, 1.0]);
        plain.addcdiv_sqrt_(&num, &sq, -0.01, div, eps).unwrap();

        let mut enc = Tensor::from_vec(vec![1.0, 1.0, 1.0]).encrypt();
        enc.addcdiv_sqrt_(&fine(&num), &fine(&sq), -0.01, div, eps)
            .unwrap();

        assert!(enc.is_encrypted());
        for (p, e) in plain.to_vec().iter().zip(enc.to_vec()) {
            assert!((p - e).abs() < 1e-5, "{p} vs {e}");
        }
    }

    #[test]
    fn encrypted_ops_keep_their_precision() {
        let mut fine = Tensor::Encrypted(CrypTensor::encrypt_with(&array![2e-11f32].into_dyn(), 44));
        fine.mul_scalar_(0.5);
        fine.addcmul_(&Tensor::from_vec(vec![1e-5]), &Tensor::from_vec(vec![1e-6]), 1.0)
            .unwrap();

        let Tensor::Encrypted(c) = &fine else {
            panic!("expected an encrypted tensor");
        };
        assert_eq!(c.frac_bits(), 44);
        assert!((fine.item().unwrap() - 2e-11).abs() < 1e-13);
    }

    #[test]
    fn cat_flattens_in_order() {
        let a = Tensor::from_vec(vec![1.0]);
        let b = Tensor::from(array![[2.0f32, 3.0]].into_dyn()).encrypt();

        let cat = Tensor::cat(&[a, b]);
        assert!(cat.is_encrypted());
        assert_eq!(cat.to_vec(), [1.0, 2.0, 3.0]);
    }
}
