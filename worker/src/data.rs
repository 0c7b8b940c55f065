use ndarray::{Array1, Array2};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, StandardNormal};

/// A batch of samples, one per row.
#[derive(Debug, Clone)]
pub struct Batch {
    pub xs: Array2<f32>,
    pub ys: Array2<f32>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.xs.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An endless stream of samples of a noisy linear map.
///
/// The map only depends on the seed, so every worker learns the same function
/// while drawing its own samples.
#[derive(Debug)]
pub struct Synthetic {
    weight: Array2<f32>,
    bias: Array1<f32>,
    rng: StdRng,
}

impl Synthetic {
    const NOISE_STD: f32 = 0.01;

    /// Creates a new `Synthetic` data source.
    ///
    /// # Arguments
    /// * `in_features` - The size of every input.
    /// * `out_features` - The size of every target.
    /// * `seed` - Defines the underlying map.
    /// * `stream` - Defines which samples are drawn, like the rank of the worker.
    pub fn new(in_features: usize, out_features: usize, seed: u64, stream: u64) -> Self {
        let mut map_rng = StdRng::seed_from_u64(seed);
        let weight = Array2::from_shape_simple_fn((out_features, in_features), || {
            StandardNormal.sample(&mut map_rng)
        });
        let bias = Array1::from_shape_simple_fn(out_features, || {
            StandardNormal.sample(&mut map_rng)
        });

        let stream_seed = seed ^ stream.wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let rng = StdRng::seed_from_u64(stream_seed);

        Self {
            weight,
            bias,
            rng,
        }
    }

    /// Draws `size` new samples.
    pub fn batch(&mut self, size: usize) -> Batch {
        let in_features = self.weight.ncols();
        let rng = &mut self.rng;

        let xs = Array2::from_shape_simple_fn((size, in_features), || {
            StandardNormal.sample(&mut *rng)
        });

        let mut ys = xs.dot(&self.weight.t()) + &self.bias;
        ys.mapv_inplace(|y| {
            let noise: f32 = StandardNormal.sample(&mut *rng);
            y + Self::NOISE_STD * noise
        });

        Batch { xs, ys }
    }
}
