pub mod error;
pub mod grad_mode;
pub mod meters;
pub mod optimization;
pub mod params;
pub mod reduction;
pub mod tensor;

pub use error::{ErrKind, MlErr, Result};
