//! YOLOv5-face post-processing.
//!
//! The exported graph already contains the detect head, so each of the N
//! rows of its single `[1, N, 16]` output is, in input pixels:
//! cx, cy, w, h, objectness, 5 landmark (x, y) pairs, class score.

use anyhow::Result;

use crate::face::Detection;

pub const CONF_THRESHOLD: f32 = 0.7;
pub const NMS_THRESHOLD: f32 = 0.5;

const ROW: usize = 16;

pub fn decode(outputs: &[(&[i64], &[f32])], conf_threshold: f32) -> Result<Vec<Detection>> {
    let Some(&(shape, data)) = outputs.first() else {
        anyhow::bail!("YOLOv5-face model produced no outputs");
    };
    if shape.len() != 3 || shape[0] != 1 || shape[2] as usize != ROW {
        anyhow::bail!("Unexpected YOLOv5-face output shape {:?}, expected [1, N, {}]", shape, ROW);
    }

    let mut detections = Vec::new();
    for row in data.chunks_exact(ROW) {
        let score = row[4] * row[15];
        if score < conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let mut landmarks = [0.0f32; 10];
        landmarks.copy_from_slice(&row[5..15]);
        detections.push(Detection {
            bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
            score,
            landmarks,
        });
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_filters_by_obj_times_cls() {
        let mut data = vec![0.0f32; 2 * ROW];
        // kept row
        data[..5].copy_from_slice(&[100.0, 100.0, 40.0, 60.0, 0.9]);
        data[5] = 90.0;
        data[15] = 0.95;
        // dropped row: high objectness, weak class
        data[ROW + 4] = 0.9;
        data[ROW + 15] = 0.5;

        let shape = [1i64, 2, 16];
        let dets = decode(&[(&shape[..], data.as_slice())], CONF_THRESHOLD).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, [80.0, 70.0, 40.0, 60.0]);
        assert_eq!(dets[0].landmarks[0], 90.0);
    }

    #[test]
    fn decode_rejects_wrong_width() {
        let shape = [1i64, 1, 15];
        let data = [0.0f32; 15];
        assert!(decode(&[(&shape[..], &data[..])], 0.5).is_err());
    }
}
