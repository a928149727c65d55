use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{arr1, Array4, ArrayView4};
use ort::{
    ep::{self, ExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::Value,
};

/// Side length of the canonical face crop every restoration network takes.
pub const FACE_SIZE: usize = 512;

pub fn session_builder() -> Result<SessionBuilder> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    #[cfg(feature = "openvino")]
    {
        let ep = ep::OpenVINO::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("openvino feature is enabled, onnx runtime not compiled with openvino")
        }
    }

    #[cfg(feature = "cuda")]
    {
        let ep = ep::CUDA::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("cuda feature is enabled, onnx runtime not compiled with cuda")
        }
    }

    Ok(builder)
}

/// A network mapping a normalized `[1, 3, 512, 512]` RGB face in `[-1, 1]`
/// to a restored face of the same shape and range.
pub trait FaceRestorer {
    fn restore(&mut self, face: ArrayView4<'_, f32>, fidelity: f64) -> Result<Array4<f32>>;
}

/// Hyper-parameters the CodeFormer checkpoints were trained with.
///
/// An exported ONNX graph already bakes these in, so nothing here changes
/// how inference runs. They are only reported in the debug log at load.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeFormerConfig {
    pub dim_embd: usize,
    pub codebook_size: usize,
    pub n_head: usize,
    pub n_layers: usize,
    pub connect_list: [&'static str; 4],
    pub checkpoint_key: &'static str,
}

impl Default for CodeFormerConfig {
    fn default() -> Self {
        Self {
            dim_embd: 512,
            codebook_size: 1024,
            n_head: 8,
            n_layers: 9,
            connect_list: ["32", "64", "128", "256"],
            checkpoint_key: "params_ema",
        }
    }
}

/// Which family a restoration checkpoint belongs to, resolved once at load.
#[derive(Debug, Clone, PartialEq)]
pub enum RestorationArch {
    /// Takes the fidelity weight as a second input.
    CodeFormer(CodeFormerConfig),
    /// Single image in, single image out (GFPGAN, RestoreFormer, ...).
    Generic,
}

impl RestorationArch {
    pub fn from_model_name(name: &str) -> Self {
        if name.to_lowercase().contains("codeformer") {
            Self::CodeFormer(CodeFormerConfig::default())
        } else {
            Self::Generic
        }
    }

    /// Whether the network takes the fidelity weight as an extra input.
    pub fn takes_fidelity(&self) -> bool {
        matches!(self, Self::CodeFormer(_))
    }
}

pub struct RestorationModel {
    arch: RestorationArch,
    session: Session,
}

impl RestorationModel {
    pub fn load(path: &Path, arch: RestorationArch) -> Result<Self> {
        let session = session_builder()?
            .commit_from_file(path)
            .with_context(|| format!("load restoration model {}", path.display()))?;

        if let RestorationArch::CodeFormer(cfg) = &arch {
            log::debug!(
                "CodeFormer dim_embd={} codebook={} heads={} layers={} connect={:?} ({})",
                cfg.dim_embd,
                cfg.codebook_size,
                cfg.n_head,
                cfg.n_layers,
                cfg.connect_list,
                cfg.checkpoint_key
            );
        }

        Ok(Self { arch, session })
    }

    pub fn arch(&self) -> &RestorationArch {
        &self.arch
    }
}

impl FaceRestorer for RestorationModel {
    fn restore(&mut self, face: ArrayView4<'_, f32>, fidelity: f64) -> Result<Array4<f32>> {
        let face_tensor = Value::from_array(face.to_owned())?;
        let outputs = if self.arch.takes_fidelity() {
            let weight = Value::from_array(arr1(&[fidelity]))?;
            self.session.run(ort::inputs![face_tensor, weight])?
        } else {
            self.session.run(ort::inputs![face_tensor])?
        };

        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        anyhow::ensure!(
            dims.len() == 4,
            "restoration output must be [N, C, H, W], got {:?}",
            dims
        );
        let restored = Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), data.to_vec())?;
        Ok(restored)
    }
}
