//! Tensor helpers shared by the model and the evaluation pass.
//!
//! Images are `(N, C, H, W)` and masks or predictions are `(N, H, W)`.

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView4, Axis, Zip};

use crate::{MlErr, Result};

/// Flattens an `(N, C, H, W)` tensor into a `(N * H * W, C)` matrix, one row per pixel.
pub fn to_pixels(x: ArrayView4<f32>) -> Result<Array2<f32>> {
    let (n, c, h, w) = x.dim();
    let nhwc = x.permuted_axes([0, 2, 3, 1]);
    let pixels = nhwc.as_standard_layout().into_owned().into_shape_with_order((n * h * w, c))?;
    Ok(pixels)
}

/// Inverse of [`to_pixels`], folding a `(N * H * W, C)` matrix back into `(N, C, H, W)`.
pub fn from_pixels(x: ArrayView2<f32>, (n, h, w): (usize, usize, usize)) -> Result<Array4<f32>> {
    if x.nrows() != n * h * w {
        return Err(MlErr::SizeMismatch {
            what: "pixel rows",
            got: x.nrows(),
            expected: n * h * w,
        });
    }

    let c = x.ncols();
    let nhwc = x.as_standard_layout().into_owned().into_shape_with_order((n, h, w, c))?;
    Ok(nhwc.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned())
}

/// Rounds `dim` to the nearest multiple of `multiple`, halves rounding up, never below
/// `multiple`.
pub fn round_to_multiple(dim: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return dim;
    }

    let units = (dim as f64 / multiple as f64 + 0.5) as usize;
    units.max(1) * multiple
}

/// Source coordinate and interpolation weight of every output index along one axis, with
/// the corner pixels of input and output aligned.
fn axis_taps(from: usize, to: usize) -> Vec<(usize, usize, f32)> {
    let scale = if to > 1 {
        (from - 1) as f32 / (to - 1) as f32
    } else {
        0.0
    };

    (0..to)
        .map(|i| {
            let src = i as f32 * scale;
            let lo = (src.floor() as usize).min(from - 1);
            let hi = (lo + 1).min(from - 1);
            (lo, hi, src - lo as f32)
        })
        .collect()
}

/// Bilinearly resizes the spatial dims of an `(N, C, H, W)` tensor, aligning corners.
pub fn resize_bilinear(x: ArrayView4<f32>, (out_h, out_w): (usize, usize)) -> Result<Array4<f32>> {
    let (n, c, h, w) = x.dim();
    if h == 0 || w == 0 || out_h == 0 || out_w == 0 {
        return Err(MlErr::Shape(format!(
            "can't resize ({h}, {w}) into ({out_h}, {out_w})"
        )));
    }

    if (h, w) == (out_h, out_w) {
        return Ok(x.to_owned());
    }

    let rows = axis_taps(h, out_h);
    let cols = axis_taps(w, out_w);
    let mut out = Array4::zeros((n, c, out_h, out_w));

    Zip::from(out.outer_iter_mut())
        .and(x.outer_iter())
        .par_for_each(|mut out, x| {
            for (mut out, plane) in out.outer_iter_mut().zip(x.outer_iter()) {
                for (i, &(r0, r1, fr)) in rows.iter().enumerate() {
                    for (j, &(c0, c1, fc)) in cols.iter().enumerate() {
                        let top = plane[[r0, c0]] * (1.0 - fc) + plane[[r0, c1]] * fc;
                        let bottom = plane[[r1, c0]] * (1.0 - fc) + plane[[r1, c1]] * fc;
                        out[[i, j]] = top * (1.0 - fr) + bottom * fr;
                    }
                }
            }
        });

    Ok(out)
}

/// Picks the highest scoring class of every pixel of an `(N, K, H, W)` tensor.
///
/// Ties go to the lowest class index.
pub fn argmax_channels(scores: ArrayView4<f32>) -> Result<Array3<u8>> {
    let (n, k, h, w) = scores.dim();
    if k > u8::MAX as usize {
        return Err(MlErr::TooManyClasses(k));
    }

    let mut pred = Array3::zeros((n, h, w));
    let mut best = Array3::from_elem((n, h, w), f32::NEG_INFINITY);

    for (class, plane) in scores.axis_iter(Axis(1)).enumerate() {
        Zip::from(&mut pred)
            .and(&mut best)
            .and(&plane)
            .for_each(|pred, best, &score| {
                if score > *best {
                    *best = score;
                    *pred = class as u8;
                }
            });
    }

    Ok(pred)
}
