use ndarray::{Array1, ArrayD, Axis, IxDyn, Zip};
use rand::Rng;

use crate::error::{MlErr, Result};

/// Amount of fractional bits of the default fixed point encoding.
pub const FRAC_BITS: u32 = 24;

/// Encodes a real number as a ring element with the default precision.
pub fn encode(x: f32) -> i64 {
    encode_with(x, FRAC_BITS)
}

/// Decodes a ring element with the default precision back into a real number.
pub fn decode(x: i64) -> f32 {
    decode_with(x, FRAC_BITS)
}

fn scale(frac_bits: u32) -> f64 {
    2f64.powi(frac_bits as i32)
}

/// Values out of range saturate to the ring's bounds.
fn encode_with(x: f32, frac_bits: u32) -> i64 {
    (x as f64 * scale(frac_bits)).round() as i64
}

fn decode_with(x: i64, frac_bits: u32) -> f32 {
    (x as f64 / scale(frac_bits)) as f32
}

/// A secret shared tensor.
///
/// Values are encoded in fixed point and split in two additive shares over the
/// ring of 64 bit integers, neither share alone says anything about the value.
/// Linear operations work share-wise, the rest go through a reveal followed by
/// a fresh sharing of the result at the same precision.
#[derive(Debug, Clone)]
pub struct CrypTensor {
    shares: [ArrayD<i64>; 2],
    frac_bits: u32,
}

impl CrypTensor {
    /// Secret shares a plaintext tensor.
    ///
    /// # Arguments
    /// * `plain` - The values to hide.
    pub fn encrypt(plain: &ArrayD<f32>) -> Self {
        Self::encrypt_with(plain, FRAC_BITS)
    }

    /// Secret shares a plaintext tensor with `frac_bits` fractional bits.
    ///
    /// More fractional bits keep smaller values at the cost of range, a value
    /// must stay below `2^(63 - frac_bits)` in magnitude.
    pub fn encrypt_with(plain: &ArrayD<f32>, frac_bits: u32) -> Self {
        let mut rng = rand::rng();
        let mask = plain.mapv(|_| rng.random::<i64>());
        let masked = Zip::from(plain)
            .and(&mask)
            .map_collect(|&x, &r| encode_with(x, frac_bits).wrapping_sub(r));

        Self {
            shares: [mask, masked],
            frac_bits,
        }
    }

    /// Secret shares `plain` with the precision of this tensor.
    pub fn reshare(&self, plain: &ArrayD<f32>) -> Self {
        Self::encrypt_with(plain, self.frac_bits)
    }

    /// Returns the amount of fractional bits of the encoding.
    pub fn frac_bits(&self) -> u32 {
        self.frac_bits
    }

    /// Returns this tensor encoded with `frac_bits` fractional bits.
    pub fn with_frac_bits(&self, frac_bits: u32) -> Self {
        if frac_bits == self.frac_bits {
            return self.clone();
        }

        Self::encrypt_with(&self.reveal(), frac_bits)
    }

    /// Secret shares a tensor of zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::encrypt(&ArrayD::zeros(IxDyn(shape)))
    }

    /// Recombines the shares into the plaintext values.
    pub fn reveal(&self) -> ArrayD<f32> {
        let [a, b] = &self.shares;
        let frac_bits = self.frac_bits;
        Zip::from(a)
            .and(b)
            .map_collect(|&a, &b| decode_with(a.wrapping_add(b), frac_bits))
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.shares[0].shape()
    }

    /// Adds `other` in place, share by share.
    ///
    /// An operand with a different precision is re-encoded first.
    pub fn add_(&mut self, other: &CrypTensor) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(MlErr::ShapeMismatch {
                a: "encrypted tensor",
                b: "encrypted operand",
                got: other.shape().to_vec(),
                expected: self.shape().to_vec(),
            });
        }

        if other.frac_bits != self.frac_bits {
            return self.add_(&other.with_frac_bits(self.frac_bits));
        }

        for (share, other) in self.shares.iter_mut().zip(&other.shares) {
            Zip::from(share)
                .and(other)
                .for_each(|s, &o| *s = s.wrapping_add(o));
        }

        Ok(())
    }

    /// Selects `indices` along `axis` from both shares.
    pub fn select(&self, axis: usize, indices: &[usize]) -> Self {
        let [a, b] = &self.shares;

        Self {
            shares: [
                a.select(Axis(axis), indices),
                b.select(Axis(axis), indices),
            ],
            frac_bits: self.frac_bits,
        }
    }

    /// Flattens and concatenates `parts`, share by share.
    ///
    /// The result has the precision of the first part.
    pub fn cat(parts: &[CrypTensor]) -> Self {
        let frac_bits = parts.first().map_or(FRAC_BITS, |part| part.frac_bits);
        let parts: Vec<_> = parts
            .iter()
            .map(|part| part.with_frac_bits(frac_bits))
            .collect();

        let share = |i: usize| {
            let flat: Vec<i64> = parts
                .iter()
                .flat_map(|part| part.shares[i].iter().copied())
                .collect();
            Array1::from_vec(flat).into_dyn()
        };

        Self {
            shares: [share(0), share(1)],
            frac_bits,
        }
    }

    /// Serializes both shares for the wire, the first share comes first.
    ///
    /// The wire carries the default precision, other precisions are re-encoded.
    pub fn to_wire(&self) -> Vec<i64> {
        if self.frac_bits != FRAC_BITS {
            return self.with_frac_bits(FRAC_BITS).to_wire();
        }

        let [a, b] = &self.shares;
        a.iter().chain(b.iter()).copied().collect()
    }

    /// Deserializes a tensor serialized with `to_wire`.
    ///
    /// # Arguments
    /// * `wire` - Both shares, one after the other.
    /// * `shape` - The shape of the tensor.
    ///
    /// # Returns
    /// The tensor, or a `ShapeMismatch` if `wire` doesn't hold two shares of `shape`.
    pub fn from_wire(wire: &[i64], shape: &[usize]) -> Result<Self> {
        let len: usize = shape.iter().product();

        if wire.len() != 2 * len {
            return Err(MlErr::ShapeMismatch {
                a: "wire payload",
                b: "encrypted tensor",
                got: vec![wire.len()],
                expected: vec![2 * len],
            });
        }

        let (a, b) = wire.split_at(len);
        let share = |s: &[i64]| {
            ArrayD::from_shape_vec(IxDyn(shape), s.to_vec()).map_err(|_| MlErr::ShapeMismatch {
                a: "wire payload",
                b: "encrypted tensor",
                got: vec![s.len()],
                expected: shape.to_vec(),
            })
        };

        Ok(Self {
            shares: [share(a)?, share(b)?],
            frac_bits: FRAC_BITS,
        })
    }
}
