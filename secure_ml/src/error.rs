use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use crate::params::ParamId;

/// The result type used in the entire secure learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The secure learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    InvalidLearningRate(f32),
    InvalidEpsilon(f32),
    InvalidBeta {
        index: usize,
        value: f32,
    },
    InvalidWeightDecay(f32),
    UnsupportedReduction(String),
    SparseGradient {
        param: String,
    },
    ParamNotFound {
        param: String,
    },
    NotAVariable {
        param: String,
    },
    DuplicateParam {
        param: String,
    },
    UnknownParam(ParamId),
    StateShapeMismatch {
        param: String,
        state: Vec<usize>,
        expected: Vec<usize>,
    },
    ShapeMismatch {
        a: &'static str,
        b: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    EmptyTensor,
    Collective(io::Error),
}

/// The broad category of an `MlErr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrKind {
    /// Invalid hyperparameters or unsupported method names, caught before doing any work.
    Config,
    /// A code path that isn't implemented, like sparse gradients.
    Unsupported,
    /// The caller broke a structural contract, like compacting an unknown parameter.
    Structural,
    /// Failures while running, like a broken transport.
    Runtime,
}

impl MlErr {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrKind {
        match self {
            MlErr::InvalidLearningRate(_)
            | MlErr::InvalidEpsilon(_)
            | MlErr::InvalidBeta { .. }
            | MlErr::InvalidWeightDecay(_)
            | MlErr::UnsupportedReduction(_) => ErrKind::Config,
            MlErr::SparseGradient { .. } => ErrKind::Unsupported,
            MlErr::ParamNotFound { .. }
            | MlErr::NotAVariable { .. }
            | MlErr::DuplicateParam { .. }
            | MlErr::UnknownParam(_)
            | MlErr::StateShapeMismatch { .. }
            | MlErr::ShapeMismatch { .. } => ErrKind::Structural,
            MlErr::EmptyTensor | MlErr::Collective(_) => ErrKind::Runtime,
        }
    }
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::InvalidLearningRate(lr) => write!(f, "Invalid learning rate: {lr}"),
            MlErr::InvalidEpsilon(eps) => write!(f, "Invalid epsilon value: {eps}"),
            MlErr::InvalidBeta { index, value } => {
                write!(f, "Invalid beta parameter at index {index}: {value}")
            }
            MlErr::InvalidWeightDecay(wd) => write!(f, "Invalid weight_decay value: {wd}"),
            MlErr::UnsupportedReduction(method) => {
                write!(f, "Reduction method {method:?} is not supported")
            }
            MlErr::SparseGradient { param } => {
                write!(f, "AdamW does not support sparse gradients, found one for {param}")
            }
            MlErr::ParamNotFound { param } => {
                write!(f, "Parameter {param} is not in any of the optimizer's groups")
            }
            MlErr::NotAVariable { param } => {
                write!(f, "Only variables can be dropped, {param} is a buffer")
            }
            MlErr::DuplicateParam { param } => {
                write!(f, "Parameter {param} appears in more than one parameter group")
            }
            MlErr::UnknownParam(id) => write!(f, "There's no parameter for the handle {id}"),
            MlErr::StateShapeMismatch {
                param,
                state,
                expected,
            } => write!(
                f,
                "The optimizer state of {param} has shape {state:?} but the parameter has shape {expected:?}"
            ),
            MlErr::ShapeMismatch {
                a,
                b,
                got,
                expected,
            } => write!(
                f,
                "There's a shape mismatch between {a} and {b}, got {got:?} and expected {expected:?}"
            ),
            MlErr::EmptyTensor => write!(f, "Tried to reduce an empty tensor"),
            MlErr::Collective(e) => write!(f, "Collective operation failed: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Collective(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Collective(value)
    }
}
