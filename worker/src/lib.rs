pub mod bootstrap;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod trainer;

pub use bootstrap::{train_local, train_tcp};
pub use config::{PruneConfig, TrainConfig};
pub use error::WorkerErr;
pub use metrics::EpochReport;
pub use trainer::Trainer;
