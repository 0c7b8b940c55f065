mod adamw;
mod compaction;
mod optimizer;

pub use adamw::{AdamState, AdamW, AdamWConfig, ParamGroup};
pub use compaction::{ChannelMask, CompressDrop, CompressMask, select_channels};
pub use optimizer::Optimizer;
