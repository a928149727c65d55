//! Per-image face session: detect, align, collect restored faces, paste back.
//!
//! The helper keeps state between those steps, so one instance must only be
//! driven by one caller at a time. Call [`FaceRestoreHelper::clean_all`]
//! before and after each image.

use std::borrow::Cow;

use anyhow::{Context, Result};
use ndarray::{Array2, Array3, Zip};

use crate::align::{self, Affine};
use crate::composite::resize_linear;
use crate::face::{Detection, FaceDetector};

/// Fill colour for crop pixels that fall outside the source image (BGR).
const CROP_BORDER: [u8; 3] = [135, 133, 132];

/// Images with a shorter side than this are upsized before detection.
const MIN_INPUT_SIDE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkOptions {
    /// Keep only the face nearest the image centre.
    pub only_center_face: bool,
    /// Keep only the face with the largest box. Wins over `only_center_face`.
    pub only_keep_largest: bool,
    /// Upsize so the shorter side reaches this before detecting. Never downsizes.
    pub resize: Option<u32>,
    /// Drop faces whose eyes are closer than this, in source pixels.
    pub eye_dist_threshold: Option<f32>,
}

impl Default for LandmarkOptions {
    fn default() -> Self {
        Self {
            only_center_face: false,
            only_keep_largest: false,
            resize: Some(640),
            eye_dist_threshold: Some(5.0),
        }
    }
}

pub struct FaceRestoreHelper {
    detector: Box<dyn FaceDetector>,
    face_size: usize,
    face_template: [[f32; 2]; 5],
    upscale_factor: f32,
    input_img: Option<Array3<u8>>,
    det_faces: Vec<Detection>,
    all_landmarks_5: Vec<[[f32; 2]; 5]>,
    affine_matrices: Vec<Affine>,
    inverse_affine_matrices: Vec<Affine>,
    cropped_faces: Vec<Array3<u8>>,
    restored_faces: Vec<Array3<u8>>,
}

impl FaceRestoreHelper {
    pub fn new(detector: Box<dyn FaceDetector>, face_size: usize) -> Self {
        Self {
            detector,
            face_size,
            face_template: align::face_template(face_size),
            upscale_factor: 1.0,
            input_img: None,
            det_faces: Vec::new(),
            all_landmarks_5: Vec::new(),
            affine_matrices: Vec::new(),
            inverse_affine_matrices: Vec::new(),
            cropped_faces: Vec::new(),
            restored_faces: Vec::new(),
        }
    }

    /// Drop everything tied to the current image.
    pub fn clean_all(&mut self) {
        self.input_img = None;
        self.det_faces.clear();
        self.all_landmarks_5.clear();
        self.affine_matrices.clear();
        self.inverse_affine_matrices.clear();
        self.cropped_faces.clear();
        self.restored_faces.clear();
    }

    /// Take a BGR `[H, W, 3]` image. Small images are upsized so the shorter
    /// side is at least 512, so later results may not match the input size.
    pub fn read_image(&mut self, bgr: Array3<u8>) -> Result<()> {
        let (h, w, c) = bgr.dim();
        anyhow::ensure!(c == 3, "expected a 3-channel image, got {} channels", c);
        anyhow::ensure!(h > 0 && w > 0, "empty image");

        let short = h.min(w);
        let img = if short < MIN_INPUT_SIDE {
            let f = MIN_INPUT_SIDE as f32 / short as f32;
            let size = ((h as f32 * f).round() as usize, (w as f32 * f).round() as usize);
            log::debug!("upsizing {}x{} input to {}x{}", w, h, size.1, size.0);
            resize_linear(bgr.view(), size)?
        } else {
            bgr
        };
        self.input_img = Some(img);
        Ok(())
    }

    fn input(&self) -> Result<&Array3<u8>> {
        self.input_img
            .as_ref()
            .context("no image loaded, call read_image first")
    }

    /// Detect faces and keep their 5-point landmarks. Returns the face count.
    pub fn get_face_landmarks_5(&mut self, opts: LandmarkOptions) -> Result<usize> {
        let input = self
            .input_img
            .as_ref()
            .context("no image loaded, call read_image first")?;
        let (h, w, _) = input.dim();

        let (detect_img, scale): (Cow<'_, Array3<u8>>, f32) = match opts.resize {
            None => (Cow::Borrowed(input), 1.0),
            Some(target) => {
                let scale = (target as f32 / h.min(w) as f32).max(1.0);
                let size = ((h as f32 * scale) as usize, (w as f32 * scale) as usize);
                (Cow::Owned(resize_linear(input.view(), size)?), scale)
            }
        };

        let detections = self.detector.detect(detect_img.view()).context("detecting faces")?;

        for det in detections {
            let det = det.unscaled(scale);
            if let Some(threshold) = opts.eye_dist_threshold {
                if det.eye_distance() < threshold {
                    log::debug!("skipping face with eye distance {:.1}", det.eye_distance());
                    continue;
                }
            }
            self.all_landmarks_5.push(det.landmarks_5());
            self.det_faces.push(det);
        }

        if self.det_faces.is_empty() {
            return Ok(0);
        }

        let keep = if opts.only_keep_largest {
            Some(index_of_min(&self.det_faces, |d| -d.area()))
        } else if opts.only_center_face {
            let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
            Some(index_of_min(&self.det_faces, |d| {
                let (fx, fy) = d.center();
                ((fx - cx).powi(2) + (fy - cy).powi(2)).sqrt()
            }))
        } else {
            None
        };
        if let Some(idx) = keep {
            self.det_faces = vec![self.det_faces[idx].clone()];
            self.all_landmarks_5 = vec![self.all_landmarks_5[idx]];
        }

        Ok(self.all_landmarks_5.len())
    }

    /// Warp every detected face onto the canonical template.
    pub fn align_warp_face(&mut self) -> Result<()> {
        let input = self
            .input_img
            .as_ref()
            .context("no image loaded, call read_image first")?;
        for landmarks in &self.all_landmarks_5 {
            let affine = align::estimate_similarity(landmarks, &self.face_template);
            let cropped = align::warp_affine(
                input.view(),
                &affine,
                (self.face_size, self.face_size),
                &CROP_BORDER,
            );
            self.affine_matrices.push(affine);
            self.cropped_faces.push(cropped);
        }
        Ok(())
    }

    pub fn add_restored_face(&mut self, face: Array3<u8>) {
        self.restored_faces.push(face);
    }

    /// Compute the crop-to-image transforms used by the paste step.
    pub fn get_inverse_affine(&mut self) -> Result<()> {
        self.inverse_affine_matrices.clear();
        for (idx, affine) in self.affine_matrices.iter().enumerate() {
            let inverse = affine
                .invert()
                .with_context(|| format!("alignment transform {} is singular", idx))?;
            self.inverse_affine_matrices
                .push(inverse.scaled(self.upscale_factor));
        }
        Ok(())
    }

    /// Paste restored faces onto a copy of the input image, feathering each
    /// face in with an eroded and blurred mask.
    pub fn paste_faces_to_input_image(&self) -> Result<Array3<u8>> {
        let input = self.input()?;
        anyhow::ensure!(
            self.restored_faces.len() == self.inverse_affine_matrices.len(),
            "{} restored faces but {} inverse transforms",
            self.restored_faces.len(),
            self.inverse_affine_matrices.len()
        );

        let (h, w, _) = input.dim();
        let mut canvas = input.mapv(f32::from);
        let ones = Array2::<f32>::ones((self.face_size, self.face_size));

        for (face, inverse) in self.restored_faces.iter().zip(&self.inverse_affine_matrices) {
            let inv_restored = align::warp_affine(face.view(), inverse, (h, w), &[0, 0, 0]);
            let inv_mask = align::warp_affine_mask(ones.view(), inverse, (h, w));
            let inv_mask_erosion = align::erode(&inv_mask, 2);

            let total_face_area = inv_mask_erosion.sum();
            let w_edge = (total_face_area.max(0.0).sqrt() as usize) / 20;
            let inv_mask_center = align::erode(&inv_mask_erosion, w_edge * 2);
            let soft_mask = align::gaussian_blur(&inv_mask_center, w_edge * 2 + 1);

            Zip::indexed(&mut canvas).for_each(|(y, x, c), px| {
                let pasted = inv_mask_erosion[[y, x]] * inv_restored[[y, x, c]] as f32;
                let m = soft_mask[[y, x]];
                *px = m * pasted + (1.0 - m) * *px;
            });
        }

        Ok(canvas.mapv(|v| v.round().clamp(0.0, 255.0) as u8))
    }

    pub fn input_image(&self) -> Option<&Array3<u8>> {
        self.input_img.as_ref()
    }

    pub fn det_faces(&self) -> &[Detection] {
        &self.det_faces
    }

    pub fn all_landmarks_5(&self) -> &[[[f32; 2]; 5]] {
        &self.all_landmarks_5
    }

    pub fn cropped_faces(&self) -> &[Array3<u8>] {
        &self.cropped_faces
    }

    pub fn restored_faces(&self) -> &[Array3<u8>] {
        &self.restored_faces
    }

    pub fn face_size(&self) -> usize {
        self.face_size
    }
}

fn index_of_min(faces: &[Detection], key: impl Fn(&Detection) -> f32) -> usize {
    faces
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| key(a).total_cmp(&key(b)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
