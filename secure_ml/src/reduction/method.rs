use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::Deserialize;

use crate::{
    error::{MlErr, Result},
    tensor::Tensor,
};

/// How the values of a metric are combined across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceMethod {
    #[default]
    Avg,
    Sum,
    Max,
    Min,
}

impl ReduceMethod {
    /// Reduces every element of `tensor` into a zero dimensional tensor of the same variant.
    pub fn apply(self, tensor: &Tensor) -> Result<Tensor> {
        match self {
            ReduceMethod::Avg => tensor.mean(),
            ReduceMethod::Sum => tensor.sum(),
            ReduceMethod::Max => tensor.max(),
            ReduceMethod::Min => tensor.min(),
        }
    }
}

impl FromStr for ReduceMethod {
    type Err = MlErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "avg" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(MlErr::UnsupportedReduction(other.to_string())),
        }
    }
}

impl Display for ReduceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReduceMethod::Avg => "avg",
            ReduceMethod::Sum => "sum",
            ReduceMethod::Max => "max",
            ReduceMethod::Min => "min",
        };

        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_methods_only() {
        for method in ["avg", "sum", "max", "min"] {
            let parsed: ReduceMethod = method.parse().unwrap();
            assert_eq!(parsed.to_string(), method);
        }

        let err = "median".parse::<ReduceMethod>().unwrap_err();
        assert!(matches!(err, MlErr::UnsupportedReduction(m) if m == "median"));
    }
}
