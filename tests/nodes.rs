use std::cell::Cell;
use std::collections::VecDeque;

use anyhow::Result;
use facerestore::{
    CropFaceNode, Detection, DetectorKind, DetectorProvider, FaceDetector, FaceRestoreNode,
    FaceRestorer, RestoreParams,
};
use facerestore_vision::align::FACE_TEMPLATE_512;
use ndarray::{s, Array2, Array4, ArrayView3, ArrayView4};
use rand::Rng;

/// Reports a scripted number of template-aligned faces per call.
struct Scripted {
    counts: VecDeque<usize>,
    tiny_eyes: bool,
}

impl FaceDetector for Scripted {
    fn detect(&mut self, bgr: ArrayView3<'_, u8>) -> Result<Vec<Detection>> {
        let n = self.counts.pop_front().unwrap_or(0);
        // half-size template face at (100, 100) of a 512 image, scaled to
        // the detection input
        let scale = bgr.dim().1 as f32 / 512.0;
        let mut landmarks = [0.0f32; 10];
        for (i, [x, y]) in FACE_TEMPLATE_512.iter().enumerate() {
            landmarks[i * 2] = (x * 0.5 + 100.0) * scale;
            landmarks[i * 2 + 1] = (y * 0.5 + 100.0) * scale;
        }
        if self.tiny_eyes {
            landmarks[2] = landmarks[0] + 1.0;
            landmarks[3] = landmarks[1];
        }
        let face = Detection {
            bbox: [175.0 * scale, 190.0 * scale, 110.0 * scale, 120.0 * scale],
            score: 0.99,
            landmarks,
        };
        Ok(vec![face; n])
    }
}

struct Provider {
    counts: Vec<usize>,
    tiny_eyes: bool,
    loads: Cell<usize>,
}

impl Provider {
    fn new(counts: &[usize]) -> Self {
        Self {
            counts: counts.to_vec(),
            tiny_eyes: false,
            loads: Cell::new(0),
        }
    }
}

impl DetectorProvider for Provider {
    fn detector(&self, _kind: DetectorKind) -> Result<Box<dyn FaceDetector>> {
        self.loads.set(self.loads.get() + 1);
        Ok(Box::new(Scripted {
            counts: self.counts.iter().copied().collect(),
            tiny_eyes: self.tiny_eyes,
        }))
    }
}

struct NoDetector;

impl DetectorProvider for NoDetector {
    fn detector(&self, kind: DetectorKind) -> Result<Box<dyn FaceDetector>> {
        anyhow::bail!("{} is not available", kind)
    }
}

/// Always answers with a white face.
struct White;

impl FaceRestorer for White {
    fn restore(&mut self, face: ArrayView4<'_, f32>, _fidelity: f64) -> Result<Array4<f32>> {
        Ok(Array4::ones(face.raw_dim()))
    }
}

struct Failing;

impl FaceRestorer for Failing {
    fn restore(&mut self, _face: ArrayView4<'_, f32>, _fidelity: f64) -> Result<Array4<f32>> {
        anyhow::bail!("CUDA out of memory")
    }
}

fn constant_batch(n: usize, value: u8) -> Array4<f32> {
    Array4::from_elem((n, 512, 512, 3), f32::from(value) / 255.0)
}

fn random_batch(n: usize, h: usize, w: usize) -> Array4<f32> {
    let mut rng = rand::thread_rng();
    Array4::from_shape_fn((n, h, w, 3), |_| f32::from(rng.gen::<u8>()) / 255.0)
}

fn max_diff(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

#[test]
fn test_no_faces_returns_input() -> Result<()> {
    env_logger::try_init().ok();
    let batch = random_batch(2, 512, 530);
    let provider = Provider::new(&[0, 0]);
    let mut node = FaceRestoreNode::new();
    let params = RestoreParams {
        blend_factor: 0.5,
        ..RestoreParams::default()
    };

    let out = node.restore_face(
        &provider,
        Some(&mut White),
        batch.view(),
        DetectorKind::Yolov5n,
        params,
        None,
    )?;
    assert_eq!(out.shape(), batch.shape());
    assert!(max_diff(&out, &batch) < 1e-4);
    println!("✓ images without faces pass through");
    Ok(())
}

#[test]
fn test_no_faces_small_image_survives_upsize() -> Result<()> {
    // shorter side under 512: upsized for detection, resized back after paste
    let batch = Array4::from_shape_fn((1, 100, 120, 3), |(_, y, x, c)| {
        f32::from((20 + x + y + c) as u8) / 255.0
    });
    let mut node = FaceRestoreNode::new();
    let out = node.restore_face(
        &Provider::new(&[0]),
        Some(&mut White),
        batch.view(),
        DetectorKind::RetinafaceResnet50,
        RestoreParams::default(),
        None,
    )?;
    assert_eq!(out.shape(), &[1, 100, 120, 3]);
    let worst = max_diff(&out, &batch) * 255.0;
    assert!(worst <= 1.01, "max diff {:.2} levels", worst);
    Ok(())
}

#[test]
fn test_missing_model_short_circuits() -> Result<()> {
    let batch = random_batch(1, 32, 32);
    let mut node = FaceRestoreNode::new();
    let out = node.restore_face(
        &NoDetector,
        None,
        batch.view(),
        DetectorKind::RetinafaceResnet50,
        RestoreParams::default(),
        None,
    )?;
    assert_eq!(out, batch);
    Ok(())
}

#[test]
fn test_missing_detector_is_an_error() {
    let batch = constant_batch(1, 10);
    let mut node = FaceRestoreNode::new();
    let res = node.restore_face(
        &NoDetector,
        Some(&mut White),
        batch.view(),
        DetectorKind::RetinafaceResnet50,
        RestoreParams::default(),
        None,
    );
    assert!(res.is_err());
}

#[test]
fn test_failed_inference_falls_back_to_crop() -> Result<()> {
    env_logger::try_init().ok();
    let batch = constant_batch(2, 100);
    let provider = Provider::new(&[1, 2]);
    let mut node = FaceRestoreNode::new();

    let out = node.restore_face(
        &provider,
        Some(&mut Failing),
        batch.view(),
        DetectorKind::RetinafaceMobile025,
        RestoreParams::default(),
        None,
    )?;
    assert!(max_diff(&out, &batch) <= 1.5 / 255.0);
    Ok(())
}

#[test]
fn test_restored_face_is_pasted_and_blended() -> Result<()> {
    let batch = constant_batch(1, 40);
    let mut node = FaceRestoreNode::new();

    let full = node.restore_face(
        &Provider::new(&[1]),
        Some(&mut White),
        batch.view(),
        DetectorKind::Yolov5l,
        RestoreParams::default(),
        None,
    )?;
    assert!(full[[0, 228, 228, 0]] > 0.93);
    assert!((full[[0, 0, 0, 0]] - 40.0 / 255.0).abs() < 1e-4);

    let none = FaceRestoreNode::new().restore_face(
        &Provider::new(&[1]),
        Some(&mut White),
        batch.view(),
        DetectorKind::Yolov5l,
        RestoreParams {
            blend_factor: 0.0,
            ..RestoreParams::default()
        },
        None,
    )?;
    assert!(max_diff(&none, &batch) < 1e-4);
    Ok(())
}

#[test]
fn test_mask_selects_blend_factor() -> Result<()> {
    let batch = constant_batch(1, 40);
    let mask = Array2::<f32>::zeros((512, 512));
    let params = RestoreParams {
        blend_factor: 1.0,
        blend_factor_unmasked: 0.0,
        ..RestoreParams::default()
    };

    // empty mask: everything is unmasked and keeps the original
    let mut node = FaceRestoreNode::new();
    let out = node.restore_face(
        &Provider::new(&[1]),
        Some(&mut White),
        batch.view(),
        DetectorKind::Yolov5n,
        params,
        Some(mask.view()),
    )?;
    assert!(max_diff(&out, &batch) < 1e-4);

    // inverted: everything is masked and takes the restoration
    let mut node = FaceRestoreNode::new();
    let out = node.restore_face(
        &Provider::new(&[1]),
        Some(&mut White),
        batch.view(),
        DetectorKind::Yolov5n,
        RestoreParams {
            inverse_mask: true,
            ..params
        },
        Some(mask.view()),
    )?;
    assert!(out[[0, 228, 228, 2]] > 0.93);
    Ok(())
}

#[test]
fn test_wrong_mask_size_is_an_error() {
    let batch = constant_batch(1, 40);
    let mask = Array2::<f32>::zeros((100, 100));
    let mut node = FaceRestoreNode::new();
    let res = node.restore_face(
        &Provider::new(&[0]),
        Some(&mut White),
        batch.view(),
        DetectorKind::Yolov5n,
        RestoreParams::default(),
        Some(mask.view()),
    );
    assert!(res.is_err());
}

#[test]
fn test_detector_change_recreates_helper() -> Result<()> {
    let batch = constant_batch(1, 40);
    let provider = Provider::new(&[]);
    let mut node = FaceRestoreNode::new();
    let mut run = |kind| {
        node.restore_face(
            &provider,
            Some(&mut White),
            batch.view(),
            kind,
            RestoreParams::default(),
            None,
        )
    };
    run(DetectorKind::Yolov5n)?;
    run(DetectorKind::Yolov5n)?;
    run(DetectorKind::RetinafaceResnet50)?;
    assert_eq!(provider.loads.get(), 2);
    Ok(())
}

#[test]
fn test_crop_slots_follow_face_counts() -> Result<()> {
    env_logger::try_init().ok();
    let batch = constant_batch(2, 100);

    for (counts, expected) in [
        (vec![2, 0], 3),
        (vec![0, 0], 2),
        (vec![1, 1], 2),
        (vec![0, 3], 4),
    ] {
        let mut node = CropFaceNode::default();
        let out = node.crop_face(&Provider::new(&counts), batch.view(), DetectorKind::Yolov5n)?;
        assert_eq!(out.shape(), &[expected, 512, 512, 3], "counts {:?}", counts);

        // same input, same detector, same count
        let again = CropFaceNode::default().crop_face(
            &Provider::new(&counts),
            batch.view(),
            DetectorKind::Yolov5n,
        )?;
        assert_eq!(again.shape()[0], expected);
    }
    Ok(())
}

#[test]
fn test_crop_keeps_order_and_placeholders() -> Result<()> {
    let mut batch = constant_batch(2, 100);
    batch.slice_mut(s![1, .., .., ..]).fill(200.0 / 255.0);

    let mut node = CropFaceNode::default();
    let out = node.crop_face(
        &Provider::new(&[0, 2]),
        batch.view(),
        DetectorKind::RetinafaceResnet50,
    )?;
    assert_eq!(out.shape()[0], 3);

    assert!(out.slice(s![0, .., .., ..]).iter().all(|&v| v == 0.0));
    for slot in 1..3 {
        assert!((out[[slot, 256, 256, 0]] - 200.0 / 255.0).abs() < 1.5 / 255.0);
    }
    Ok(())
}

#[test]
fn test_close_set_eyes_leave_a_placeholder() -> Result<()> {
    let batch = constant_batch(1, 100);
    let provider = Provider {
        tiny_eyes: true,
        ..Provider::new(&[1])
    };
    let out = CropFaceNode::default().crop_face(&provider, batch.view(), DetectorKind::Yolov5n)?;
    assert_eq!(out.shape()[0], 1);
    assert!(out.iter().all(|&v| v == 0.0));
    Ok(())
}
