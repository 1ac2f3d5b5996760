use ndarray::{Array2, Array4, ArrayView4, Axis, concatenate, s};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use super::{
    ChangeDetector,
    activations::ActFn,
    layers::Dense,
    params::{BACKBONE, HEAD, ParamGroup, ParamGroups},
};
use crate::{MlErr, Result, ops};

/// The width presets of the shared encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneSize {
    Small,
    Base,
    Large,
    Giant,
}

impl BackboneSize {
    /// Reads the size from a backbone name such as `dinov2_small`, only the part after the
    /// last `_` is looked at.
    pub fn from_backbone(backbone: &str) -> Result<Self> {
        let suffix = backbone.rsplit('_').next().unwrap_or(backbone);

        match suffix {
            "small" => Ok(Self::Small),
            "base" => Ok(Self::Base),
            "large" => Ok(Self::Large),
            "giant" => Ok(Self::Giant),
            _ => Err(MlErr::UnknownBackbone(backbone.to_string())),
        }
    }

    /// The amount of features the encoder extracts per pixel.
    pub fn features(self) -> usize {
        match self {
            Self::Small => 8,
            Self::Base => 16,
            Self::Large => 32,
            Self::Giant => 64,
        }
    }
}

/// A siamese per-pixel change detector.
///
/// Both images go through the same encoder, a dense layer with a ReLU, and the head, a
/// dense layer over the concatenated features, scores every class. The encoder weights
/// live in the `backbone` group and the head's in the `head` group.
pub struct SiameseNet {
    features: usize,
    nclass: usize,
    params: ParamGroups,
    encoder_a: Dense,
    encoder_b: Dense,
    head: Dense,
    last_dim: Option<(usize, usize, usize)>,
}

/// He initialized weights followed by zeroed biases.
fn init_dense(rng: &mut StdRng, (fan_in, fan_out): (usize, usize), gain: f32) -> Result<Vec<f32>> {
    let normal = Normal::new(0.0, (gain / fan_in as f32).sqrt())?;

    let mut params: Vec<f32> = normal.sample_iter(&mut *rng).take(fan_in * fan_out).collect();
    params.resize((fan_in + 1) * fan_out, 0.0);
    Ok(params)
}

impl SiameseNet {
    /// Creates a new `SiameseNet` with seeded random parameters.
    ///
    /// # Arguments
    /// * `in_channels` - The channels of each input image.
    /// * `size` - The encoder's width preset.
    /// * `nclass` - The amount of classes to score.
    /// * `seed` - The seed of the initialization.
    pub fn new(in_channels: usize, size: BackboneSize, nclass: usize, seed: u64) -> Result<Self> {
        let features = size.features();
        let mut rng = StdRng::seed_from_u64(seed);

        let encoder_dim = (in_channels, features);
        let head_dim = (2 * features, nclass);

        let params = ParamGroups::new([
            ParamGroup::new(BACKBONE, init_dense(&mut rng, encoder_dim, 2.0)?),
            ParamGroup::new(HEAD, init_dense(&mut rng, head_dim, 1.0)?),
        ]);

        let encoder = Dense::new(encoder_dim, Some(ActFn::relu()));

        Ok(Self {
            features,
            nclass,
            params,
            encoder_a: encoder.clone(),
            encoder_b: encoder,
            head: Dense::new(head_dim, None),
            last_dim: None,
        })
    }

    fn check_pair(a: &ArrayView4<f32>, b: &ArrayView4<f32>) -> Result<(usize, usize, usize)> {
        if a.dim() != b.dim() {
            return Err(MlErr::ShapeMismatch {
                what: "image pair",
                got: b.shape().to_vec(),
                expected: a.shape().to_vec(),
            });
        }

        let (n, _, h, w) = a.dim();
        Ok((n, h, w))
    }
}

impl ChangeDetector for SiameseNet {
    fn nclass(&self) -> usize {
        self.nclass
    }

    fn params(&self) -> &ParamGroups {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamGroups {
        &mut self.params
    }

    fn forward(&mut self, a: ArrayView4<f32>, b: ArrayView4<f32>) -> Result<Array4<f32>> {
        let dim = Self::check_pair(&a, &b)?;
        let (pa, pb) = (ops::to_pixels(a)?, ops::to_pixels(b)?);

        let backbone = self.params.get(BACKBONE)?.params();
        let ha = self.encoder_a.forward(backbone, pa.view())?;
        let hb = self.encoder_b.forward(backbone, pb.view())?;
        let features = concatenate(Axis(1), &[ha, hb])?;

        let head = self.params.get(HEAD)?.params();
        let scores = self.head.forward(head, features.view())?;

        self.last_dim = Some(dim);
        ops::from_pixels(scores, dim)
    }

    fn backward(&mut self, d_scores: ArrayView4<f32>) -> Result<()> {
        let dim = self.last_dim.take().ok_or(MlErr::BackwardBeforeForward)?;
        let (n, h, w) = dim;
        let expected = [n, self.nclass, h, w];
        if d_scores.shape() != expected {
            return Err(MlErr::ShapeMismatch {
                what: "score gradient",
                got: d_scores.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }

        let d = ops::to_pixels(d_scores)?;

        let (head, head_grad) = self.params.get_mut(HEAD)?.split_for_backward();
        let d_features = self.head.backward(head, head_grad, d.view())?;

        let f = self.features;
        let (backbone, backbone_grad) = self.params.get_mut(BACKBONE)?.split_for_backward();
        self.encoder_a
            .backward(backbone, backbone_grad, d_features.slice(s![.., ..f]))?;
        self.encoder_b
            .backward(backbone, backbone_grad, d_features.slice(s![.., f..]))?;

        Ok(())
    }

    fn predict(&self, a: ArrayView4<f32>, b: ArrayView4<f32>) -> Result<Array4<f32>> {
        let dim = Self::check_pair(&a, &b)?;
        let (pa, pb) = (ops::to_pixels(a)?, ops::to_pixels(b)?);

        let backbone = self.params.get(BACKBONE)?.params();
        let ha = self.encoder_a.infer(backbone, pa.view())?;
        let hb = self.encoder_b.infer(backbone, pb.view())?;
        let features: Array2<f32> = concatenate(Axis(1), &[ha.view(), hb.view()])?;

        let scores = self.head.infer(self.params.get(HEAD)?.params(), features.view())?;
        ops::from_pixels(scores.view(), dim)
    }
}
