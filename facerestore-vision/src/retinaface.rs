//! RetinaFace post-processing.
//!
//! RetinaFace is anchor based. For every stride (8, 16, 32) and every grid
//! cell it places two square priors and regresses offsets relative to them:
//! - loc:   [1, N, 4]  - box deltas (dcx, dcy, dw, dh)
//! - conf:  [1, N, 2]  - background / face logits
//! - landm: [1, N, 10] - landmark deltas
//!
//! Decoding (variances v0 = 0.1, v1 = 0.2):
//! cx = prior_cx + dcx * v0 * prior_w
//! w  = prior_w * exp(dw * v1)
//! lx = prior_cx + dlx * v0 * prior_w

use anyhow::Result;
use ndarray::Array2;

use crate::face::Detection;

const STEPS: [usize; 3] = [8, 16, 32];
const MIN_SIZES: [[f32; 2]; 3] = [[16.0, 32.0], [64.0, 128.0], [256.0, 512.0]];
const VARIANCE: [f32; 2] = [0.1, 0.2];

pub const MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];
pub const CONF_THRESHOLD: f32 = 0.8;
pub const NMS_THRESHOLD: f32 = 0.4;

/// Prior boxes for a square input, one row per prior: cx, cy, w, h (normalized).
pub fn prior_boxes(input_size: usize) -> Array2<f32> {
    let count: usize = STEPS
        .iter()
        .zip(MIN_SIZES.iter())
        .map(|(&step, sizes)| input_size.div_ceil(step).pow(2) * sizes.len())
        .sum();
    let mut priors = Array2::<f32>::zeros((count, 4));
    let mut row = 0;
    for (k, &step) in STEPS.iter().enumerate() {
        let feature = input_size.div_ceil(step);
        for i in 0..feature {
            for j in 0..feature {
                for &min_size in &MIN_SIZES[k] {
                    let s = min_size / input_size as f32;
                    let cx = (j as f32 + 0.5) * step as f32 / input_size as f32;
                    let cy = (i as f32 + 0.5) * step as f32 / input_size as f32;
                    priors.row_mut(row).assign(&ndarray::arr1(&[cx, cy, s, s]));
                    row += 1;
                }
            }
        }
    }
    priors
}

/// Softmax face probability from a (background, face) logit pair.
pub fn face_probability(background: f32, face: f32) -> f32 {
    let m = background.max(face);
    let eb = (background - m).exp();
    let ef = (face - m).exp();
    ef / (eb + ef)
}

/// Decode raw outputs into detections in input-canvas pixels.
///
/// Outputs are identified by their trailing dimension (4, 2, 10), so the
/// order the model emits them in does not matter.
pub fn decode(
    outputs: &[(&[i64], &[f32])],
    input_size: usize,
    conf_threshold: f32,
) -> Result<Vec<Detection>> {
    let mut loc = None;
    let mut conf = None;
    let mut landm = None;
    for &(shape, data) in outputs {
        if shape.len() != 3 || shape[0] != 1 {
            anyhow::bail!("Unexpected RetinaFace output shape {:?}", shape);
        }
        let rows = shape[1] as usize;
        let cols = shape[2] as usize;
        let arr = Array2::from_shape_vec((rows, cols), data.to_vec())?;
        match cols {
            4 => loc = Some(arr),
            2 => conf = Some(arr),
            10 => landm = Some(arr),
            other => anyhow::bail!("Unexpected RetinaFace output width {}", other),
        }
    }
    let (Some(loc), Some(conf), Some(landm)) = (loc, conf, landm) else {
        anyhow::bail!("RetinaFace model must emit loc, conf and landmark outputs");
    };

    let priors = prior_boxes(input_size);
    if priors.nrows() != loc.nrows()
        || loc.nrows() != conf.nrows()
        || conf.nrows() != landm.nrows()
    {
        anyhow::bail!(
            "Expected {} priors for a {}px input, got loc={} conf={} landm={}",
            priors.nrows(),
            input_size,
            loc.nrows(),
            conf.nrows(),
            landm.nrows()
        );
    }

    let size = input_size as f32;
    let mut detections = Vec::new();
    for idx in 0..priors.nrows() {
        let score = face_probability(conf[[idx, 0]], conf[[idx, 1]]);
        if score < conf_threshold {
            continue;
        }

        let (pcx, pcy) = (priors[[idx, 0]], priors[[idx, 1]]);
        let (pw, ph) = (priors[[idx, 2]], priors[[idx, 3]]);
        let cx = pcx + loc[[idx, 0]] * VARIANCE[0] * pw;
        let cy = pcy + loc[[idx, 1]] * VARIANCE[0] * ph;
        let w = pw * (loc[[idx, 2]] * VARIANCE[1]).exp();
        let h = ph * (loc[[idx, 3]] * VARIANCE[1]).exp();

        let mut landmarks = [0.0f32; 10];
        for k in 0..5 {
            landmarks[k * 2] = (pcx + landm[[idx, k * 2]] * VARIANCE[0] * pw) * size;
            landmarks[k * 2 + 1] = (pcy + landm[[idx, k * 2 + 1]] * VARIANCE[0] * ph) * size;
        }

        detections.push(Detection {
            bbox: [(cx - w / 2.0) * size, (cy - h / 2.0) * size, w * size, h * size],
            score,
            landmarks,
        });
    }

    Ok(detections)
}
