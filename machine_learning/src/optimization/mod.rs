mod adamw;
mod optimizer;

pub use adamw::{AdamW, AdamWConfig, GroupState, OptimizerState};
pub use optimizer::Optimizer;
