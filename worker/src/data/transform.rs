use ndarray::{Array2, Array3, Axis, s};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::Sample;
use crate::error::Result;

/// The rng of the augmentation of one sample in one epoch.
pub fn sample_rng(seed: u64, epoch: usize, index: usize) -> StdRng {
    let mixed = seed
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((epoch as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9))
        .wrapping_add(index as u64);

    StdRng::seed_from_u64(mixed)
}

/// Pads the spatial dims up to `size`, images with zeros and the mask with `ignore_label`.
fn pad_to(sample: Sample, size: usize, ignore_label: u8) -> Result<Sample> {
    let (c, h, w) = sample.dim();
    if h >= size && w >= size {
        return Ok(sample);
    }

    let (ph, pw) = (h.max(size), w.max(size));
    let mut image_a = Array3::zeros((c, ph, pw));
    let mut image_b = Array3::zeros((c, ph, pw));
    let mut mask = Array2::from_elem((ph, pw), ignore_label);

    image_a.slice_mut(s![.., ..h, ..w]).assign(&sample.image_a);
    image_b.slice_mut(s![.., ..h, ..w]).assign(&sample.image_b);
    mask.slice_mut(s![..h, ..w]).assign(&sample.mask);

    Sample::new(sample.id, image_a, image_b, mask)
}

/// Randomly crops a `size x size` window, padding first if the sample is smaller, then
/// flips it horizontally half of the time.
pub fn random_crop_flip<R: Rng>(sample: Sample, size: usize, ignore_label: u8, rng: &mut R) -> Result<Sample> {
    let sample = pad_to(sample, size, ignore_label)?;
    let (_, h, w) = sample.dim();

    let top = rng.random_range(0..=h - size);
    let left = rng.random_range(0..=w - size);
    let rows = top..top + size;
    let cols = left..left + size;

    let mut image_a = sample.image_a.slice(s![.., rows.clone(), cols.clone()]).to_owned();
    let mut image_b = sample.image_b.slice(s![.., rows.clone(), cols.clone()]).to_owned();
    let mut mask = sample.mask.slice(s![rows, cols]).to_owned();

    if rng.random_bool(0.5) {
        image_a.invert_axis(Axis(2));
        image_b.invert_axis(Axis(2));
        mask.invert_axis(Axis(1));
        image_a = image_a.as_standard_layout().into_owned();
        image_b = image_b.as_standard_layout().into_owned();
        mask = mask.as_standard_layout().into_owned();
    }

    Sample::new(sample.id, image_a, image_b, mask)
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    fn sample(h: usize, w: usize) -> Sample {
        let image_a = Array::from_shape_fn((2, h, w), |(c, i, j)| (c * 100 + i * 10 + j) as f32);
        let mask = Array::from_shape_fn((h, w), |(i, j)| (i * 10 + j) as u8);
        Sample::new("s", image_a.clone(), image_a, mask).unwrap()
    }

    #[test]
    fn small_samples_are_padded_with_ignore() {
        let mut rng = sample_rng(0, 0, 0);
        let out = random_crop_flip(sample(2, 2), 3, 255, &mut rng).unwrap();

        assert_eq!(out.dim(), (2, 3, 3));
        assert_eq!(out.mask.iter().filter(|&&m| m == 255).count(), 5);
        assert_eq!(out.image_a.iter().filter(|&&x| x == 0.0).count(), 2 * 5 + 1);
    }

    #[test]
    fn crops_keep_images_and_mask_aligned() {
        for index in 0..20 {
            let mut rng = sample_rng(3, 1, index);
            let out = random_crop_flip(sample(6, 7), 4, 255, &mut rng).unwrap();

            assert_eq!(out.dim(), (2, 4, 4));
            for ((i, j), &m) in out.mask.indexed_iter() {
                // Channel 0 encodes the same position as the mask.
                assert_eq!(out.image_a[[0, i, j]], m as f32);
            }
        }
    }

    #[test]
    fn same_seed_same_augmentation() {
        let a = random_crop_flip(sample(8, 8), 4, 255, &mut sample_rng(1, 2, 3)).unwrap();
        let b = random_crop_flip(sample(8, 8), 4, 255, &mut sample_rng(1, 2, 3)).unwrap();
        assert_eq!(a, b);
    }
}
