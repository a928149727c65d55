//! Similarity-transform alignment and the raster operations used to paste
//! faces back: affine warps, mask erosion and Gaussian softening.

use image::{ImageBuffer, Luma};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

/// Canonical 5-point positions (eyes, nose, mouth corners) in a 512x512 crop.
pub const FACE_TEMPLATE_512: [[f32; 2]; 5] = [
    [192.98138, 239.94708],
    [318.90277, 240.1936],
    [256.63416, 314.01935],
    [201.26117, 371.41043],
    [313.08905, 371.15118],
];

/// 2x3 affine matrix, row-major: `[a, b, tx, c, d, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(pub [f32; 6]);

impl Affine {
    pub fn identity() -> Self {
        Self([1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.0;
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    /// Inverse transform, `None` when the linear part is singular.
    pub fn invert(&self) -> Option<Self> {
        let [a, b, tx, c, d, ty] = self.0;
        let det = a * d - b * c;
        if det.abs() < 1e-12 {
            return None;
        }
        let ia = d / det;
        let ib = -b / det;
        let ic = -c / det;
        let id = a / det;
        Some(Self([
            ia,
            ib,
            -(ia * tx + ib * ty),
            ic,
            id,
            -(ic * tx + id * ty),
        ]))
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self(self.0.map(|v| v * factor))
    }
}

/// Face template scaled to an arbitrary square crop size.
pub fn face_template(face_size: usize) -> [[f32; 2]; 5] {
    let ratio = face_size as f32 / 512.0;
    FACE_TEMPLATE_512.map(|[x, y]| [x * ratio, y * ratio])
}

/// Least-squares 4-DOF similarity (rotation, uniform scale, translation)
/// mapping `src` points onto `dst`.
pub fn estimate_similarity(src: &[[f32; 2]; 5], dst: &[[f32; 2]; 5]) -> Affine {
    // unknowns [a, b, tx, ty] with x' = a*x - b*y + tx, y' = b*x + a*y + ty
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];
    for (s, d) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (s[0] as f64, s[1] as f64);
        let rows = [([sx, -sy, 1.0, 0.0], d[0] as f64), ([sy, sx, 0.0, 1.0], d[1] as f64)];
        for (r, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += r[j] * r[k];
                }
                atb[j] += r[j] * rhs;
            }
        }
    }

    let Some([a, b, tx, ty]) = solve4(ata, atb) else {
        return Affine::identity();
    };
    Affine([a as f32, -b as f32, tx as f32, b as f32, a as f32, ty as f32])
}

#[allow(clippy::needless_range_loop)]
fn solve4(mut m: [[f64; 4]; 4], mut rhs: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);
        for row in col + 1..4 {
            let f = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= f * m[col][k];
            }
            rhs[row] -= f * rhs[col];
        }
    }
    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let tail: f64 = (i + 1..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Backward-mapping bilinear warp of an `[H, W, C]` byte image.
///
/// `forward` maps source pixels to output pixels; output pixels whose source
/// falls outside the image take `border`.
pub fn warp_affine(
    src: ArrayView3<'_, u8>,
    forward: &Affine,
    out_size: (usize, usize),
    border: &[u8],
) -> Array3<u8> {
    let (h, w, channels) = src.dim();
    let (out_h, out_w) = out_size;
    let mut out = Array3::<u8>::zeros((out_h, out_w, channels));
    let Some(inv) = forward.invert() else {
        return out;
    };

    for oy in 0..out_h {
        for ox in 0..out_w {
            let (sx, sy) = inv.apply(ox as f32, oy as f32);
            match bilinear_taps(sx, sy, w, h) {
                Some(taps) => {
                    for c in 0..channels {
                        let v: f32 =
                            taps.iter().map(|&(y, x, wt)| src[[y, x, c]] as f32 * wt).sum();
                        out[[oy, ox, c]] = v.round().clamp(0.0, 255.0) as u8;
                    }
                }
                None => {
                    for c in 0..channels {
                        out[[oy, ox, c]] = border.get(c).copied().unwrap_or(0);
                    }
                }
            }
        }
    }
    out
}

/// Same warp for a single-channel float mask, zero outside.
pub fn warp_affine_mask(
    src: ArrayView2<'_, f32>,
    forward: &Affine,
    out_size: (usize, usize),
) -> Array2<f32> {
    let (h, w) = src.dim();
    let mut out = Array2::<f32>::zeros(out_size);
    let Some(inv) = forward.invert() else {
        return out;
    };
    for ((oy, ox), px) in out.indexed_iter_mut() {
        let (sx, sy) = inv.apply(ox as f32, oy as f32);
        if let Some(taps) = bilinear_taps(sx, sy, w, h) {
            *px = taps.iter().map(|&(y, x, wt)| src[[y, x]] * wt).sum();
        }
    }
    out
}

fn bilinear_taps(sx: f32, sy: f32, w: usize, h: usize) -> Option<[(usize, usize, f32); 4]> {
    if w == 0 || h == 0 || sx < 0.0 || sy < 0.0 || sx > (w - 1) as f32 || sy > (h - 1) as f32 {
        return None;
    }
    let x0 = sx.floor() as usize;
    let y0 = sy.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;
    Some([
        (y0, x0, (1.0 - fx) * (1.0 - fy)),
        (y0, x1, fx * (1.0 - fy)),
        (y1, x0, (1.0 - fx) * fy),
        (y1, x1, fx * fy),
    ])
}

/// Morphological erosion with a `k`x`k` rectangle anchored at its centre.
/// Pixels outside the image do not participate.
pub fn erode(mask: &Array2<f32>, k: usize) -> Array2<f32> {
    if k <= 1 {
        return mask.clone();
    }
    let before = k / 2;
    let after = k - 1 - before;
    let (h, w) = mask.dim();

    let mut rows = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let lo = x.saturating_sub(before);
            let hi = (x + after).min(w - 1);
            rows[[y, x]] = (lo..=hi).map(|i| mask[[y, i]]).fold(f32::INFINITY, f32::min);
        }
    }
    let mut out = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        let lo = y.saturating_sub(before);
        let hi = (y + after).min(h - 1);
        for x in 0..w {
            out[[y, x]] = (lo..=hi).map(|i| rows[[i, x]]).fold(f32::INFINITY, f32::min);
        }
    }
    out
}

/// Gaussian blur for an odd kernel size, sigma derived from the kernel the
/// way OpenCV does when sigma is left at zero.
pub fn gaussian_blur(mask: &Array2<f32>, ksize: usize) -> Array2<f32> {
    let (h, w) = mask.dim();
    if ksize <= 1 || h == 0 || w == 0 {
        return mask.clone();
    }
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;

    let buf: ImageBuffer<Luma<f32>, Vec<f32>> =
        match ImageBuffer::from_raw(w as u32, h as u32, mask.iter().copied().collect()) {
            Some(buf) => buf,
            None => return mask.clone(),
        };
    let blurred = image::imageops::blur(&buf, sigma);
    Array2::from_shape_vec((h, w), blurred.into_raw()).unwrap_or_else(|_| mask.clone())
}
