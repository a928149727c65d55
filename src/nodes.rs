//! The three graph nodes: restore faces in a batch, crop faces out of a
//! batch, and load a restoration model.
//!
//! Host batches are `[B, H, W, 3]` RGB floats in `[0, 1]`.

use anyhow::{Context, Result};
use facerestore_vision::composite::{blend_masked, blend_uniform, resize_linear};
use facerestore_vision::model::RestorationArch;
use facerestore_vision::tensor::{
    host_to_bgr_u8, img2tensor, normalize, swap_channels, tensor2img_u8,
};
use facerestore_vision::{
    BlendFactors, DetectorKind, FaceRestoreHelper, FaceRestorer, FaceSlots, LandmarkOptions,
    RestorationModel, FACE_SIZE,
};
use log::{debug, error, info};
use ndarray::{s, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, Ix3};
use serde::Serialize;

use crate::config::Config;
use crate::registry::{DetectorProvider, ModelRegistry, FACERESTORE_MODELS};

pub const NODE_CATEGORY: &str = "facerestore_cf";

/// Per-channel mean and std mapping `[0, 1]` onto `[-1, 1]`.
const FACE_NORM: [f32; 3] = [0.5, 0.5, 0.5];

#[derive(Debug, Clone, Serialize)]
pub struct NodeSpec {
    pub name: &'static str,
    pub required: Vec<InputSpec>,
    pub optional: Vec<InputSpec>,
    pub return_types: Vec<&'static str>,
    pub function: &'static str,
    pub category: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputSpec {
    pub name: &'static str,
    #[serde(flatten)]
    pub kind: InputKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputKind {
    Image,
    Mask,
    FacerestoreModel,
    Float { default: f64, min: f64, max: f64, step: f64 },
    Boolean { default: bool },
    Choice { options: Vec<String> },
}

impl InputSpec {
    fn new(name: &'static str, kind: InputKind) -> Self {
        Self { name, kind }
    }

    fn float(name: &'static str, default: f64, step: f64) -> Self {
        Self::new(
            name,
            InputKind::Float {
                default,
                min: 0.0,
                max: 1.0,
                step,
            },
        )
    }
}

fn detector_choice() -> InputSpec {
    InputSpec::new(
        "facedetection",
        InputKind::Choice {
            options: DetectorKind::ALL.iter().map(|k| k.as_str().to_string()).collect(),
        },
    )
}

/// Declarations for every node, keyed by node name.
pub fn node_specs(registry: &ModelRegistry) -> Result<Vec<NodeSpec>> {
    let models = registry.get_filename_list(FACERESTORE_MODELS)?;
    Ok(vec![
        NodeSpec {
            name: "FaceRestoreCFWithModel",
            required: vec![
                InputSpec::new("facerestore_model", InputKind::FacerestoreModel),
                InputSpec::new("image", InputKind::Image),
                detector_choice(),
                InputSpec::float("codeformer_fidelity", 0.5, 0.05),
                InputSpec::float("blend_factor", 1.0, 0.01),
                InputSpec::float("blend_factor_unmasked", 0.0, 0.01),
                InputSpec::new("inverse_mask", InputKind::Boolean { default: false }),
            ],
            optional: vec![InputSpec::new("mask", InputKind::Mask)],
            return_types: vec!["IMAGE"],
            function: "restore_face",
            category: NODE_CATEGORY,
        },
        NodeSpec {
            name: "CropFace",
            required: vec![InputSpec::new("image", InputKind::Image), detector_choice()],
            optional: vec![],
            return_types: vec!["IMAGE"],
            function: "crop_face",
            category: NODE_CATEGORY,
        },
        NodeSpec {
            name: "FaceRestoreModelLoader",
            required: vec![InputSpec::new("model_name", InputKind::Choice { options: models })],
            optional: vec![],
            return_types: vec!["FACERESTORE_MODEL"],
            function: "load_model",
            category: NODE_CATEGORY,
        },
    ])
}

/// Tunables for one restore call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestoreParams {
    pub codeformer_fidelity: f64,
    pub blend_factor: f32,
    pub blend_factor_unmasked: f32,
    pub inverse_mask: bool,
    pub detection_resize: u32,
    pub eye_dist_threshold: f32,
}

impl Default for RestoreParams {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RestoreParams {
    fn from(cfg: &Config) -> Self {
        Self {
            codeformer_fidelity: cfg.codeformer_fidelity,
            blend_factor: cfg.blend_factor,
            blend_factor_unmasked: cfg.blend_factor_unmasked,
            inverse_mask: cfg.inverse_mask,
            detection_resize: cfg.detection_resize,
            eye_dist_threshold: cfg.eye_dist_threshold,
        }
    }
}

impl RestoreParams {
    fn landmark_options(&self) -> LandmarkOptions {
        whole_image(self.detection_resize, self.eye_dist_threshold)
    }
}

fn whole_image(resize: u32, eye_dist_threshold: f32) -> LandmarkOptions {
    LandmarkOptions {
        only_center_face: false,
        only_keep_largest: false,
        resize: Some(resize),
        eye_dist_threshold: Some(eye_dist_threshold),
    }
}

/// Reuse the helper for `kind`, replacing it if another detector was asked for.
fn helper_for<'a>(
    slot: &'a mut Option<(DetectorKind, FaceRestoreHelper)>,
    provider: &dyn DetectorProvider,
    kind: DetectorKind,
) -> Result<&'a mut FaceRestoreHelper> {
    if slot.as_ref().map(|(k, _)| *k) != Some(kind) {
        info!("Loading face detector {}", kind);
        let detector = provider
            .detector(kind)
            .with_context(|| format!("loading face detector {}", kind))?;
        *slot = Some((kind, FaceRestoreHelper::new(detector, FACE_SIZE)));
    }
    slot.as_mut().map(|(_, helper)| helper).context("face helper not initialised")
}

fn check_batch(image: &ArrayView4<'_, f32>) -> Result<()> {
    anyhow::ensure!(
        image.shape()[3] == 3,
        "expected a [B, H, W, 3] image batch, got {:?}",
        image.shape()
    );
    Ok(())
}

/// Aligned BGR crop to a `[1, 3, H, W]` RGB network tensor in `[-1, 1]`.
fn crop_to_tensor(crop: &Array3<u8>) -> Array4<f32> {
    let unit = crop.mapv(|v| f32::from(v) / 255.0);
    let mut tensor = img2tensor(unit.view(), true);
    normalize(&mut tensor, FACE_NORM, FACE_NORM);
    tensor.insert_axis(Axis(0))
}

/// Network tensor in `[-1, 1]` back to a BGR byte face.
fn tensor_to_face(tensor: ArrayView4<'_, f32>) -> Result<Array3<u8>> {
    let img = tensor2img_u8(tensor.into_dyn(), true, (-1.0, 1.0))?;
    Ok(img.into_dimensionality::<Ix3>()?)
}

fn run_restorer(
    model: &mut dyn FaceRestorer,
    input: ArrayView4<'_, f32>,
    fidelity: f64,
) -> Result<Array3<u8>> {
    let output = model.restore(input, fidelity)?;
    tensor_to_face(output.view())
}

#[derive(Default)]
pub struct FaceRestoreNode {
    helper: Option<(DetectorKind, FaceRestoreHelper)>,
}

impl FaceRestoreNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore every face in `image` and blend the result over the input.
    ///
    /// `mask`, when given, is `[H, W]` in `[0, 1]` and is shared by the whole
    /// batch. Without a model the batch is returned unchanged.
    pub fn restore_face(
        &mut self,
        provider: &dyn DetectorProvider,
        model: Option<&mut dyn FaceRestorer>,
        image: ArrayView4<'_, f32>,
        detector: DetectorKind,
        params: RestoreParams,
        mask: Option<ArrayView2<'_, f32>>,
    ) -> Result<Array4<f32>> {
        info!(
            "Starting restore_face with codeformer_fidelity: {}",
            params.codeformer_fidelity
        );
        check_batch(&image)?;
        let Some(model) = model else {
            info!("No restoration model given, returning input unchanged");
            return Ok(image.to_owned());
        };
        let helper = helper_for(&mut self.helper, provider, detector)?;

        let factors = BlendFactors {
            masked: params.blend_factor,
            unmasked: params.blend_factor_unmasked,
        };
        let mut out = Array4::<f32>::zeros(image.raw_dim());
        for (i, cur) in image.outer_iter().enumerate() {
            let restored = restore_one(helper, &mut *model, cur, &params)?;
            let original = cur.mapv(|v| v * 255.0);
            let blended = match mask {
                Some(mask) => blend_masked(
                    original.view(),
                    restored.view(),
                    mask,
                    params.inverse_mask,
                    factors,
                )?,
                None => blend_uniform(original.view(), restored.view(), factors.masked)?,
            };
            helper.clean_all();
            out.slice_mut(s![i, .., .., ..]).assign(&(blended / 255.0));
        }
        Ok(out)
    }
}

/// Detect, restore and paste one host image. Returns RGB in `[0, 255]` at
/// the input resolution.
fn restore_one(
    helper: &mut FaceRestoreHelper,
    model: &mut dyn FaceRestorer,
    cur: ArrayView3<'_, f32>,
    params: &RestoreParams,
) -> Result<Array3<f32>> {
    let (h, w, _) = cur.dim();
    helper.clean_all();
    helper.read_image(host_to_bgr_u8(cur))?;
    helper.get_face_landmarks_5(params.landmark_options())?;
    helper.align_warp_face()?;

    let crops = helper.cropped_faces().to_vec();
    for (idx, crop) in crops.iter().enumerate() {
        let input = crop_to_tensor(crop);
        let face = match run_restorer(model, input.view(), params.codeformer_fidelity) {
            Ok(face) => face,
            Err(e) => {
                error!("Failed inference for CodeFormer: {:#}", e);
                tensor_to_face(input.view())?
            }
        };
        helper.add_restored_face(face);
        debug!("face {} restored, inference outputs released", idx);
    }

    helper.get_inverse_affine()?;
    let pasted = helper.paste_faces_to_input_image()?;
    let pasted = if pasted.dim().0 != h || pasted.dim().1 != w {
        resize_linear(pasted.view(), (h, w))?
    } else {
        pasted
    };
    Ok(swap_channels(pasted.view()).mapv(f32::from))
}

pub struct CropFaceNode {
    options: LandmarkOptions,
    helper: Option<(DetectorKind, FaceRestoreHelper)>,
}

impl Default for CropFaceNode {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CropFaceNode {
    pub fn new(options: LandmarkOptions) -> Self {
        Self { options, helper: None }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(whole_image(cfg.detection_resize, cfg.eye_dist_threshold))
    }

    /// Aligned 512x512 RGB crops of every face in the batch, in detection
    /// order. An image without faces leaves one black slot behind.
    pub fn crop_face(
        &mut self,
        provider: &dyn DetectorProvider,
        image: ArrayView4<'_, f32>,
        detector: DetectorKind,
    ) -> Result<Array4<f32>> {
        check_batch(&image)?;
        let helper = helper_for(&mut self.helper, provider, detector)?;

        let mut slots = FaceSlots::new(image.shape()[0]);
        for cur in image.outer_iter() {
            helper.clean_all();
            helper.read_image(host_to_bgr_u8(cur))?;
            helper.get_face_landmarks_5(self.options)?;
            helper.align_warp_face()?;

            let faces_found = helper.cropped_faces().len();
            if faces_found == 0 {
                slots.skip_placeholder();
            }
            slots.ensure_total(slots.cursor() + faces_found);
            for crop in helper.cropped_faces() {
                let face = tensor_to_face(crop_to_tensor(crop).view())?;
                let rgb = swap_channels(face.view()).mapv(|v| f32::from(v) / 255.0);
                slots.push(rgb.view())?;
            }
            helper.clean_all();
        }
        Ok(slots.into_array())
    }
}

#[derive(Default)]
pub struct ModelLoaderNode;

impl ModelLoaderNode {
    /// Load `model_name` from the restoration model folder.
    pub fn load_model(
        &self,
        registry: &ModelRegistry,
        model_name: &str,
    ) -> Result<RestorationModel> {
        let arch = RestorationArch::from_model_name(model_name);
        match arch {
            RestorationArch::CodeFormer(_) => info!("Loading CodeFormer: {}", model_name),
            RestorationArch::Generic => info!("Loading restoration model: {}", model_name),
        }
        let path = registry.get_full_path(FACERESTORE_MODELS, model_name)?;
        RestorationModel::load(&path, arch)
    }
}
