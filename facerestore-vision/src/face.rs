use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array4, ArrayView3};
use ort::{session::Session, value::Value};

use crate::{retinaface, yolov5face};

/// Detection result, in pixels of the image handed to the detector
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,x2,y2,...,x5,y5
}

impl Detection {
    pub fn landmarks_5(&self) -> [[f32; 2]; 5] {
        std::array::from_fn(|i| [self.landmarks[i * 2], self.landmarks[i * 2 + 1]])
    }

    /// Distance between the two eye landmarks.
    pub fn eye_distance(&self) -> f32 {
        let dx = self.landmarks[0] - self.landmarks[2];
        let dy = self.landmarks[1] - self.landmarks[3];
        (dx * dx + dy * dy).sqrt()
    }

    pub fn area(&self) -> f32 {
        self.bbox[2] * self.bbox[3]
    }

    pub fn center(&self) -> (f32, f32) {
        (self.bbox[0] + self.bbox[2] / 2.0, self.bbox[1] + self.bbox[3] / 2.0)
    }

    /// Divide every coordinate by `scale`.
    pub fn unscaled(&self, scale: f32) -> Self {
        Self {
            bbox: self.bbox.map(|v| v / scale),
            score: self.score,
            landmarks: self.landmarks.map(|v| v / scale),
        }
    }
}

/// Anything that finds faces with 5-point landmarks in a BGR byte image.
pub trait FaceDetector {
    fn detect(&mut self, bgr: ArrayView3<'_, u8>) -> Result<Vec<Detection>>;
}

/// The detector identifiers exposed to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorKind {
    RetinafaceResnet50,
    RetinafaceMobile025,
    Yolov5l,
    Yolov5n,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 4] = [
        Self::RetinafaceResnet50,
        Self::RetinafaceMobile025,
        Self::Yolov5l,
        Self::Yolov5n,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RetinafaceResnet50 => "retinaface_resnet50",
            Self::RetinafaceMobile025 => "retinaface_mobile0.25",
            Self::Yolov5l => "YOLOv5l",
            Self::Yolov5n => "YOLOv5n",
        }
    }

    /// ONNX file expected in the face detection model folder.
    pub const fn model_filename(&self) -> &'static str {
        match self {
            Self::RetinafaceResnet50 => "detection_Resnet50_Final.onnx",
            Self::RetinafaceMobile025 => "detection_mobilenet0.25_Final.onnx",
            Self::Yolov5l => "yolov5l-face.onnx",
            Self::Yolov5n => "yolov5n-face.onnx",
        }
    }

    pub const fn is_retinaface(&self) -> bool {
        matches!(self, Self::RetinafaceResnet50 | Self::RetinafaceMobile025)
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown face detector '{}'", s))
    }
}

/// Image letterboxed onto a square canvas, plus what is needed to map
/// detections back to source pixels.
pub struct Letterbox {
    pub canvas: RgbImage,
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
}

impl Letterbox {
    /// Map a detection in canvas pixels back to source pixels.
    pub fn unmap(&self, d: &Detection) -> Detection {
        let (ox, oy) = (self.offset_x as f32, self.offset_y as f32);
        let mut landmarks = [0.0f32; 10];
        for i in 0..5 {
            landmarks[i * 2] = (d.landmarks[i * 2] - ox) / self.scale;
            landmarks[i * 2 + 1] = (d.landmarks[i * 2 + 1] - oy) / self.scale;
        }
        Detection {
            bbox: [
                (d.bbox[0] - ox) / self.scale,
                (d.bbox[1] - oy) / self.scale,
                d.bbox[2] / self.scale,
                d.bbox[3] / self.scale,
            ],
            score: d.score,
            landmarks,
        }
    }
}

/// Resize keeping aspect ratio and pad to a `target_size` square.
///
/// Channel order is carried through untouched.
pub fn letterbox(img: ArrayView3<'_, u8>, target_size: u32) -> Result<Letterbox> {
    let src = array_to_image(img)?;
    let (orig_width, orig_height) = src.dimensions();

    let max_dim = orig_width.max(orig_height).max(1);
    let scale = target_size as f32 / max_dim as f32;
    let new_width = ((orig_width as f32 * scale) as u32).max(1);
    let new_height = ((orig_height as f32 * scale) as u32).max(1);

    let resized = image::imageops::resize(&src, new_width, new_height, FilterType::Triangle);

    let mut canvas = RgbImage::new(target_size, target_size);
    let offset_x = (target_size - new_width) / 2;
    let offset_y = (target_size - new_height) / 2;
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    Ok(Letterbox {
        canvas,
        scale,
        offset_x,
        offset_y,
    })
}

/// View a `[H, W, 3]` byte array as an `RgbImage` (channel order untouched).
pub fn array_to_image(img: ArrayView3<'_, u8>) -> Result<RgbImage> {
    let (h, w, c) = img.dim();
    anyhow::ensure!(c == 3, "expected 3 channels, got {}", c);
    let raw: Vec<u8> = img.iter().copied().collect();
    RgbImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| anyhow::anyhow!("failed to build image buffer"))
}

/// Pack an interleaved canvas into a `[1, 3, H, W]` tensor, mapping each
/// byte of channel `c` through `f(c, value)`. `order` picks which source
/// channel feeds each plane.
pub(crate) fn planar_input(
    canvas: &RgbImage,
    order: [usize; 3],
    f: impl Fn(usize, u8) -> f32,
) -> Result<Array4<f32>> {
    let (w, h) = canvas.dimensions();
    let pixel_count = (w * h) as usize;
    let mut input_data = vec![0.0f32; 3 * pixel_count];

    let (p0, rest) = input_data.split_at_mut(pixel_count);
    let (p1, p2) = rest.split_at_mut(pixel_count);

    let pixels = canvas.as_raw();
    for i in 0..pixel_count {
        let idx = i * 3;
        p0[i] = f(0, pixels[idx + order[0]]);
        p1[i] = f(1, pixels[idx + order[1]]);
        p2[i] = f(2, pixels[idx + order[2]]);
    }

    Ok(Array4::from_shape_vec((1, 3, h as usize, w as usize), input_data)?)
}

/// ONNX-backed detector for any [`DetectorKind`].
pub struct OnnxFaceDetector {
    kind: DetectorKind,
    session: Session,
    input_size: u32,
}

impl OnnxFaceDetector {
    pub fn load(kind: DetectorKind, path: &Path) -> Result<Self> {
        let session = crate::model::session_builder()?
            .commit_from_file(path)
            .with_context(|| format!("load {} detector from {}", kind, path.display()))?;
        Ok(Self {
            kind,
            session,
            input_size: 640,
        })
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&mut self, bgr: ArrayView3<'_, u8>) -> Result<Vec<Detection>> {
        let boxed = letterbox(bgr, self.input_size)?;
        let size = self.input_size as usize;

        let (input, conf_threshold, nms_threshold) = if self.kind.is_retinaface() {
            // BGR, mean-subtracted, 0..255
            let mean = retinaface::MEAN_BGR;
            let input = planar_input(&boxed.canvas, [0, 1, 2], |c, v| v as f32 - mean[c])?;
            (input, retinaface::CONF_THRESHOLD, retinaface::NMS_THRESHOLD)
        } else {
            // RGB, 0..1
            let input = planar_input(&boxed.canvas, [2, 1, 0], |_, v| v as f32 / 255.0)?;
            (input, yolov5face::CONF_THRESHOLD, yolov5face::NMS_THRESHOLD)
        };

        let input_tensor = Value::from_array(input)?;
        let outputs = self.session.run(ort::inputs![input_tensor])?;

        let mut output_data: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
        for (_name, output) in outputs.iter() {
            let (shape, data) = output.try_extract_tensor::<f32>()?;
            output_data.push((shape.iter().copied().collect(), data.to_vec()));
        }
        let output_refs: Vec<(&[i64], &[f32])> = output_data
            .iter()
            .map(|(s, d)| (s.as_slice(), d.as_slice()))
            .collect();

        let raw = if self.kind.is_retinaface() {
            retinaface::decode(&output_refs, size, conf_threshold)?
        } else {
            yolov5face::decode(&output_refs, conf_threshold)?
        };

        let detections: Vec<Detection> = nms(&raw, nms_threshold)
            .iter()
            .map(|d| boxed.unmap(d))
            .collect();
        log::debug!("{}: {} face(s) after nms", self.kind, detections.len());
        Ok(detections)
    }
}

/// Apply non-maximum suppression to remove overlapping detections
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return vec![];
    }

    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(sorted[i].clone());

        for j in (i + 1)..sorted.len() {
            if suppressed[j] {
                continue;
            }
            let iou = compute_iou(&sorted[i].bbox, &sorted[j].bbox);
            if iou > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    let area_a = a[2] * a[3];
    let area_b = b[2] * b[3];
    inter / (area_a + area_b - inter)
}
