//! Blending restored pixels back over the original image.
//!
//! Everything here works on `[H, W, 3]` arrays in the `[0, 255]` float domain.

use anyhow::Result;
use ndarray::{Array3, ArrayView2, ArrayView3, Zip};

/// Which share of the mask a blend factor applies to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendFactors {
    /// Strength inside the mask, and everywhere when no mask is given.
    pub masked: f32,
    /// Strength outside the mask. Unused without a mask.
    pub unmasked: f32,
}

/// Two-tap bilinear resize to exactly `(height, width)`.
///
/// Output pixel `d` samples source position `(d + 0.5) * in / out - 0.5`,
/// clamped to the image, on each axis independently. Unlike a filtered
/// resize this never widens the kernel when shrinking, so an upsize followed
/// by the matching downsize lands back on the original pixel centres.
pub fn resize_linear(img: ArrayView3<'_, u8>, size: (usize, usize)) -> Result<Array3<u8>> {
    let (in_h, in_w, channels) = img.dim();
    let (h, w) = size;
    if in_h == h && in_w == w {
        return Ok(img.to_owned());
    }
    anyhow::ensure!(
        in_h > 0 && in_w > 0 && h > 0 && w > 0,
        "cannot resize {}x{} to {}x{}",
        in_w,
        in_h,
        w,
        h
    );

    let xs = linear_taps(w, in_w);
    let ys = linear_taps(h, in_h);
    let mut out = Array3::<u8>::zeros((h, w, channels));
    Zip::indexed(&mut out).for_each(|(y, x, c), px| {
        let (y0, y1, fy) = ys[y];
        let (x0, x1, fx) = xs[x];
        let top = f32::from(img[[y0, x0, c]]) * (1.0 - fx) + f32::from(img[[y0, x1, c]]) * fx;
        let bottom = f32::from(img[[y1, x0, c]]) * (1.0 - fx) + f32::from(img[[y1, x1, c]]) * fx;
        *px = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    });
    Ok(out)
}

/// Source index pair and weight of the second tap for every output index.
fn linear_taps(out_len: usize, in_len: usize) -> Vec<(usize, usize, f32)> {
    let scale = in_len as f32 / out_len as f32;
    let last = (in_len - 1) as f32;
    (0..out_len)
        .map(|d| {
            let src = ((d as f32 + 0.5) * scale - 0.5).clamp(0.0, last);
            let i0 = src.floor() as usize;
            let i1 = (i0 + 1).min(in_len - 1);
            (i0, i1, src - i0 as f32)
        })
        .collect()
}

/// `original * (1 - factor) + restored * factor`, clipped to `[0, 255]`.
pub fn blend_uniform(
    original: ArrayView3<'_, f32>,
    restored: ArrayView3<'_, f32>,
    factor: f32,
) -> Result<Array3<f32>> {
    anyhow::ensure!(
        original.dim() == restored.dim(),
        "restored image {:?} does not match original {:?}",
        restored.dim(),
        original.dim()
    );
    let mut out = Array3::<f32>::zeros(original.raw_dim());
    Zip::from(&mut out)
        .and(&original)
        .and(&restored)
        .for_each(|o, &a, &b| *o = (a * (1.0 - factor) + b * factor).clamp(0.0, 255.0));
    Ok(out)
}

/// Blend the masked and unmasked regions with independent strengths.
///
/// `mask` is `[H, W]` in `[0, 1]` and applies to all three channels. With
/// `inverse` the regions swap. Each region is clipped on its own before the
/// two are summed.
pub fn blend_masked(
    original: ArrayView3<'_, f32>,
    restored: ArrayView3<'_, f32>,
    mask: ArrayView2<'_, f32>,
    inverse: bool,
    factors: BlendFactors,
) -> Result<Array3<f32>> {
    let (h, w, _) = original.dim();
    anyhow::ensure!(
        original.dim() == restored.dim(),
        "restored image {:?} does not match original {:?}",
        restored.dim(),
        original.dim()
    );
    anyhow::ensure!(
        mask.dim() == (h, w),
        "mask {:?} does not match image {}x{}",
        mask.dim(),
        h,
        w
    );

    let mut out = Array3::<f32>::zeros(original.raw_dim());
    Zip::indexed(&mut out)
        .and(&original)
        .and(&restored)
        .for_each(|(y, x, _), o, &a, &b| {
            let m = mask[[y, x]];
            let (inside, outside) = if inverse { (1.0 - m, m) } else { (m, 1.0 - m) };
            let first = a * inside * (1.0 - factors.masked) + b * inside * factors.masked;
            let second = a * outside * (1.0 - factors.unmasked) + b * outside * factors.unmasked;
            *o = first.clamp(0.0, 255.0) + second.clamp(0.0, 255.0);
        });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn uniform_half_of_black_and_white_is_mid_gray() {
        let black = Array3::<f32>::zeros((2, 2, 3));
        let white = Array3::<f32>::from_elem((2, 2, 3), 255.0);
        let out = blend_uniform(black.view(), white.view(), 0.5).unwrap();
        assert!(out.iter().all(|&v| v.round() == 128.0 || v.round() == 127.0));
    }

    #[test]
    fn uniform_rejects_shape_mismatch() {
        let a = Array3::<f32>::zeros((2, 2, 3));
        let b = Array3::<f32>::zeros((2, 3, 3));
        assert!(blend_uniform(a.view(), b.view(), 0.5).is_err());
    }

    #[test]
    fn masked_regions_use_their_own_factor() {
        let original = Array3::<f32>::zeros((1, 2, 3));
        let restored = Array3::<f32>::from_elem((1, 2, 3), 200.0);
        let mask = Array2::from_shape_vec((1, 2), vec![1.0, 0.0]).unwrap();
        let factors = BlendFactors {
            masked: 1.0,
            unmasked: 0.25,
        };

        let out =
            blend_masked(original.view(), restored.view(), mask.view(), false, factors).unwrap();
        assert_eq!(out[[0, 0, 0]], 200.0);
        assert_eq!(out[[0, 1, 0]], 50.0);

        let inv =
            blend_masked(original.view(), restored.view(), mask.view(), true, factors).unwrap();
        assert_eq!(inv[[0, 0, 0]], 50.0);
        assert_eq!(inv[[0, 1, 0]], 200.0);
    }

    #[test]
    fn mask_must_match_image() {
        let img = Array3::<f32>::zeros((2, 2, 3));
        let mask = Array2::<f32>::zeros((3, 2));
        let factors = BlendFactors {
            masked: 1.0,
            unmasked: 0.0,
        };
        assert!(blend_masked(img.view(), img.view(), mask.view(), false, factors).is_err());
    }

    #[test]
    fn resize_matches_half_pixel_bilinear() {
        let row = Array3::from_shape_vec((1, 2, 1), vec![0u8, 100]).unwrap();
        let up = resize_linear(row.view(), (1, 4)).unwrap();
        assert_eq!(up.iter().copied().collect::<Vec<_>>(), [0, 25, 75, 100]);

        let row = Array3::from_shape_vec((1, 4, 1), vec![0u8, 100, 200, 250]).unwrap();
        let down = resize_linear(row.view(), (1, 2)).unwrap();
        assert_eq!(down.iter().copied().collect::<Vec<_>>(), [50, 225]);
    }

    #[test]
    fn upsize_then_downsize_keeps_a_ramp() {
        let img = Array3::from_shape_fn((100, 120, 3), |(y, x, c)| (20 + x + y + c) as u8);
        let up = resize_linear(img.view(), (512, 614)).unwrap();
        let back = resize_linear(up.view(), (100, 120)).unwrap();
        let worst = img
            .iter()
            .zip(back.iter())
            .map(|(&a, &b)| (i16::from(a) - i16::from(b)).abs())
            .max()
            .unwrap();
        assert!(worst <= 1, "max diff {}", worst);
    }

    #[test]
    fn resize_rejects_empty_sizes() {
        let img = Array3::<u8>::zeros((4, 4, 3));
        assert!(resize_linear(img.view(), (0, 4)).is_err());
    }

    #[test]
    fn resize_restores_exact_resolution() {
        let img = Array3::<u8>::from_elem((600, 512, 3), 77);
        let out = resize_linear(img.view(), (300, 256)).unwrap();
        assert_eq!(out.dim(), (300, 256, 3));
        assert!(out.iter().all(|&v| v == 77));
    }
}
