pub mod activations;
pub mod layers;
pub mod loss;
mod model;
pub mod params;
mod siamese;

pub use model::ChangeDetector;
pub use siamese::{BackboneSize, SiameseNet};
