mod cross_entropy;
mod loss_fn;

pub use cross_entropy::{CrossEntropy, IGNORE_LABEL};
pub use loss_fn::LossFn;
