pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod dist;
pub mod error;
pub mod eval;
pub mod loop_;
pub mod metrics;
pub mod model;
pub mod schedule;
pub mod sink;
pub mod state;
pub mod worker;

pub use builder::WorkerBuilder;
pub use config::{RunArgs, TrainConfig};
pub use error::{Result, WorkerErr};
pub use loop_::{Phase, TrainingLoop};
pub use worker::run;
