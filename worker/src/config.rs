use std::{fs, path::{Path, PathBuf}};

use machine_learning::arch::BackboneSize;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerErr};

fn default_in_channels() -> usize {
    3
}

fn default_seed() -> u64 {
    0
}

fn default_pretrained_dir() -> PathBuf {
    PathBuf::from("pretrained")
}

/// The run configuration, read from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub dataset: String,
    pub data_root: PathBuf,
    pub nclass: usize,
    pub crop_size: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    pub lr_multi: f64,
    /// Named `<family>_<size>`, the size picks the encoder width.
    pub backbone: String,
    /// `dpt` evaluates at sizes rounded to multiples of 14.
    pub model: String,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Directory of `<backbone>.safetensors` pretrained encoder weights.
    #[serde(default = "default_pretrained_dir")]
    pub pretrained_dir: PathBuf,
}

impl TrainConfig {
    /// Reads and validates the config at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| WorkerErr::Config(format!("can't read {}: {e}", path.display())))?;

        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| WorkerErr::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |detail: &str| Err(WorkerErr::Config(detail.to_string()));

        if !(2..=u8::MAX as usize).contains(&self.nclass) {
            return fail("nclass must be in [2, 255]");
        }
        if self.batch_size == 0 || self.epochs == 0 || self.crop_size == 0 {
            return fail("batch_size, epochs and crop_size must be positive");
        }
        if self.in_channels == 0 {
            return fail("in_channels must be positive");
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) || !(self.lr_multi > 0.0 && self.lr_multi.is_finite()) {
            return fail("lr and lr_multi must be positive");
        }

        BackboneSize::from_backbone(&self.backbone).map_err(|e| WorkerErr::Config(e.to_string()))?;
        Ok(())
    }

    /// The multiple evaluation sizes are rounded to, if any.
    pub fn resize_multiple(&self) -> Option<usize> {
        (self.model == "dpt").then_some(14)
    }

    pub fn pretrained_path(&self) -> PathBuf {
        self.pretrained_dir
            .join(format!("{}.safetensors", self.backbone))
    }
}

/// What the launcher passes on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    pub config: PathBuf,
    pub labeled_id_path: PathBuf,
    pub save_path: PathBuf,
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = "
dataset: levir
data_root: /data/levir
nclass: 2
crop_size: 256
batch_size: 8
epochs: 80
lr: 0.00005
lr_multi: 10.0
backbone: dinov2_small
model: dpt
";

    #[test]
    fn defaults_fill_optional_fields() {
        let config = TrainConfig::from_yaml(YAML).unwrap();

        assert_eq!(config.in_channels, 3);
        assert_eq!(config.seed, 0);
        assert_eq!(config.resize_multiple(), Some(14));
        assert_eq!(
            config.pretrained_path(),
            PathBuf::from("pretrained/dinov2_small.safetensors")
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let one_class = YAML.replace("nclass: 2", "nclass: 1");
        assert!(matches!(TrainConfig::from_yaml(&one_class), Err(WorkerErr::Config(_))));

        let tiny = YAML.replace("dinov2_small", "dinov2_tiny");
        assert!(matches!(TrainConfig::from_yaml(&tiny), Err(WorkerErr::Config(_))));

        let unet = YAML.replace("model: dpt", "model: unet");
        assert_eq!(TrainConfig::from_yaml(&unet).unwrap().resize_multiple(), None);
    }
}
