//! Conversions between the host's image arrays and the network's tensors.
//!
//! Two layouts meet here:
//! - host/helper side: `[H, W, C]` channel-last, BGR for the helper, RGB for the host
//! - network side: `[C, H, W]` channel-first, RGB
//!
//! `img2tensor` goes towards the network, `tensor2img` comes back.

use ndarray::{
    s, Array2, Array3, Array4, ArrayD, ArrayView3, ArrayView4, ArrayViewD, Axis, Ix2, Ix3, Ix4,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("only 4D, 3D or 2D tensors are supported, got {0}D")]
    UnsupportedRank(usize),
    #[error("tensor shape mismatch: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Convert one `[H, W, C]` array into a `[C, H, W]` tensor.
///
/// Channels are reversed (BGR <-> RGB) only when `bgr2rgb` is set and the
/// array has exactly three channels; anything else passes through untouched.
pub fn img2tensor<A: Clone>(img: ArrayView3<'_, A>, bgr2rgb: bool) -> Array3<A> {
    let img = if img.shape()[2] == 3 && bgr2rgb {
        img.slice_move(s![.., .., ..;-1])
    } else {
        img
    };
    img.permuted_axes([2, 0, 1]).as_standard_layout().into_owned()
}

/// List form of [`img2tensor`].
pub fn imgs2tensor<A: Clone>(imgs: &[ArrayView3<'_, A>], bgr2rgb: bool) -> Vec<Array3<A>> {
    imgs.iter().map(|img| img2tensor(img.view(), bgr2rgb)).collect()
}

/// In-place per-channel `(x - mean) / std` on a `[C, H, W]` tensor.
pub fn normalize(tensor: &mut Array3<f32>, mean: [f32; 3], std: [f32; 3]) {
    for (c, mut channel) in tensor.axis_iter_mut(Axis(0)).enumerate().take(3) {
        let (m, sd) = (mean[c], std[c]);
        channel.mapv_inplace(|v| (v - m) / sd);
    }
}

/// Convert a network tensor back into a channel-last image in `[0, 1]`.
///
/// The tensor is clamped to `min_max` and rescaled. Accepted shapes:
/// - `[B, C, H, W]`: tiled into a single grid image
/// - `[C, H, W]`: a single image; one channel collapses to `[H, W]`
/// - `[H, W]`: returned as is
///
/// A leading batch axis of size 1 is dropped first.
pub fn tensor2img(
    tensor: ArrayViewD<'_, f32>,
    rgb2bgr: bool,
    min_max: (f32, f32),
) -> Result<ArrayD<f32>, BridgeError> {
    let tensor = if tensor.ndim() > 0 && tensor.shape()[0] == 1 {
        tensor.index_axis_move(Axis(0), 0)
    } else {
        tensor
    };

    let (lo, hi) = min_max;
    let scaled = tensor.mapv(|v| (v.clamp(lo, hi) - lo) / (hi - lo));

    match scaled.ndim() {
        4 => {
            let batch = scaled.into_dimensionality::<Ix4>()?;
            let nrow = (batch.shape()[0] as f64).sqrt() as usize;
            let grid = make_grid(batch.view(), nrow, 2);
            Ok(to_channel_last(grid, rgb2bgr).into_dyn())
        }
        3 => {
            let chw = scaled.into_dimensionality::<Ix3>()?;
            if chw.shape()[0] == 1 {
                let gray: Array2<f32> = chw.index_axis_move(Axis(0), 0);
                Ok(gray.into_dyn())
            } else {
                Ok(to_channel_last(chw, rgb2bgr).into_dyn())
            }
        }
        2 => Ok(scaled.into_dimensionality::<Ix2>()?.into_dyn()),
        n => Err(BridgeError::UnsupportedRank(n)),
    }
}

/// [`tensor2img`] followed by `x * 255`, rounding and a cast to `u8`.
pub fn tensor2img_u8(
    tensor: ArrayViewD<'_, f32>,
    rgb2bgr: bool,
    min_max: (f32, f32),
) -> Result<ArrayD<u8>, BridgeError> {
    let img = tensor2img(tensor, rgb2bgr, min_max)?;
    Ok(img.mapv(|v| (v * 255.0).round() as u8))
}

fn to_channel_last(chw: Array3<f32>, rgb2bgr: bool) -> Array3<f32> {
    let hwc = chw.permuted_axes([1, 2, 0]);
    let hwc = if rgb2bgr && hwc.shape()[2] == 3 {
        hwc.slice_move(s![.., .., ..;-1])
    } else {
        hwc
    };
    hwc.as_standard_layout().into_owned()
}

/// Tile a `[B, C, H, W]` batch into one `[C, H', W']` image, `nrow` tiles per
/// row, separated by `padding` zero pixels. Single-channel batches are
/// replicated to three channels.
pub fn make_grid(batch: ArrayView4<'_, f32>, nrow: usize, padding: usize) -> Array3<f32> {
    let (n, c, h, w) = batch.dim();
    let xmaps = nrow.max(1).min(n.max(1));
    let ymaps = n.div_ceil(xmaps);
    let height = h + padding;
    let width = w + padding;
    let channels = if c == 1 { 3 } else { c };

    let grid_h = height * ymaps + padding;
    let grid_w = width * xmaps + padding;
    let mut grid = Array3::<f32>::zeros((channels, grid_h, grid_w));
    for (k, tile) in batch.axis_iter(Axis(0)).enumerate() {
        let (y, x) = (k / xmaps, k % xmaps);
        let top = y * height + padding;
        let left = x * width + padding;
        for ch in 0..channels {
            let src = tile.index_axis(Axis(0), if c == 1 { 0 } else { ch });
            grid.slice_mut(s![ch, top..top + h, left..left + w]).assign(&src);
        }
    }
    grid
}

/// Host image (`[H, W, 3]` RGB in `[0, 1]`) to helper image (`[H, W, 3]` BGR
/// bytes), in standard layout.
pub fn host_to_bgr_u8(img: ArrayView3<'_, f32>) -> Array3<u8> {
    img.slice(s![.., .., ..;-1])
        .as_standard_layout()
        .mapv(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
}

/// Reverse the channel axis of an `[H, W, C]` array, in standard layout.
pub fn swap_channels<A: Clone>(img: ArrayView3<'_, A>) -> Array3<A> {
    img.slice(s![.., .., ..;-1]).as_standard_layout().into_owned()
}

/// Stack equally shaped `[H, W, C]` images into an `[N, H, W, C]` batch.
pub fn stack_batch(images: &[Array3<f32>]) -> Result<Array4<f32>, BridgeError> {
    let views: Vec<_> = images.iter().map(|img| img.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr3, Array};

    #[test]
    fn img2tensor_moves_channels_first_and_swaps() {
        // 1x2 image, BGR pixels
        let img = arr3(&[[[1u8, 2, 3], [4, 5, 6]]]);
        let t = img2tensor(img.view(), true);
        assert_eq!(t.shape(), &[3, 1, 2]);
        // R plane first after swap
        assert_eq!(t[[0, 0, 0]], 3);
        assert_eq!(t[[0, 0, 1]], 6);
        assert_eq!(t[[2, 0, 1]], 4);
    }

    #[test]
    fn img2tensor_skips_swap_for_non_rgb() {
        let img = Array::from_shape_vec((1, 1, 4), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let t = img2tensor(img.view(), true);
        assert_eq!(t.as_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn normalize_maps_unit_range_to_signed() {
        let mut t = Array3::from_elem((3, 2, 2), 1.0f32);
        t.slice_mut(s![1, .., ..]).fill(0.0);
        normalize(&mut t, [0.5; 3], [0.5; 3]);
        assert_eq!(t[[0, 0, 0]], 1.0);
        assert_eq!(t[[1, 1, 1]], -1.0);
    }

    #[test]
    fn tensor2img_rejects_rank_five() {
        let t = ArrayD::<f32>::zeros(ndarray::IxDyn(&[2, 2, 3, 4, 4]));
        let err = tensor2img(t.view(), true, (0.0, 1.0)).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedRank(5)));
    }

    #[test]
    fn tensor2img_rank_two_is_passthrough_shape() {
        let t = ArrayD::<f32>::from_elem(ndarray::IxDyn(&[3, 5]), 2.0);
        let img = tensor2img(t.view(), true, (0.0, 1.0)).unwrap();
        assert_eq!(img.shape(), &[3, 5]);
        assert!(img.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn tensor2img_squeezes_unit_batch_and_gray() {
        let t = ArrayD::<f32>::from_elem(ndarray::IxDyn(&[1, 1, 4, 6]), 0.0);
        let img = tensor2img_u8(t.view(), true, (-1.0, 1.0)).unwrap();
        assert_eq!(img.shape(), &[4, 6]);
        assert!(img.iter().all(|&v| v == 128));
    }

    #[test]
    fn tensor2img_grids_real_batches() {
        let t = ArrayD::<f32>::ones(ndarray::IxDyn(&[4, 3, 8, 8]));
        let img = tensor2img(t.view(), false, (0.0, 1.0)).unwrap();
        // 2x2 tiles, 8px each, 2px padding around and between
        assert_eq!(img.shape(), &[2 * 10 + 2, 2 * 10 + 2, 3]);
        assert_eq!(img[[0, 0, 0]], 0.0);
        assert_eq!(img[[2, 2, 0]], 1.0);
    }

    #[test]
    fn make_grid_replicates_single_channel() {
        let batch = Array4::<f32>::ones((2, 1, 3, 3));
        let grid = make_grid(batch.view(), 1, 2);
        assert_eq!(grid.shape(), &[3, 2 * 5 + 2, 5 + 2]);
        assert_eq!(grid[[2, 2, 2]], 1.0);
    }

    #[test]
    fn host_to_bgr_reverses_and_scales() {
        let img = arr3(&[[[1.0f32, 0.0, 0.5]]]);
        let bgr = host_to_bgr_u8(img.view());
        assert!(bgr.is_standard_layout());
        assert_eq!(bgr.as_slice().unwrap(), &[128, 0, 255]);
    }

    #[test]
    fn host_bytes_stay_within_half_a_level() {
        let img = Array3::from_shape_fn((4, 64, 3), |(y, x, c)| {
            ((y * 64 + x) * 3 + c) as f32 / 767.0
        });
        let bgr = host_to_bgr_u8(img.view());
        for ((y, x, c), &v) in img.indexed_iter() {
            let back = f32::from(bgr[[y, x, 2 - c]]);
            assert!((back - v * 255.0).abs() <= 0.5 + 1e-3);
        }
    }

    #[test]
    fn swap_channels_is_contiguous() {
        let img = arr3(&[[[1u8, 2, 3], [4, 5, 6]]]);
        let swapped = swap_channels(img.view());
        assert!(swapped.is_standard_layout());
        assert_eq!(swapped.as_slice().unwrap(), &[3, 2, 1, 6, 5, 4]);
    }
}
