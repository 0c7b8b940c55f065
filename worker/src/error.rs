use std::{error::Error, fmt, io};

use secure_ml::MlErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Ml(MlErr),
    Parse(serde_json::Error),
    InvalidConfig(String),
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Ml(e) => write!(f, "training error: {e}"),
            WorkerErr::Parse(e) => write!(f, "malformed config: {e}"),
            WorkerErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Ml(e) => Some(e),
            WorkerErr::Parse(e) => Some(e),
            WorkerErr::InvalidConfig(_) => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for WorkerErr {
    fn from(value: MlErr) -> Self {
        match value {
            MlErr::Collective(e) => Self::Io(e),
            other => Self::Ml(other),
        }
    }
}

impl From<serde_json::Error> for WorkerErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
