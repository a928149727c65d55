pub mod config;
pub mod nodes;
pub mod registry;

// Re-export vision types for convenience
pub use facerestore_vision::{
    composite, tensor, BlendFactors, Detection, DetectorKind, FaceDetector, FaceRestoreHelper,
    FaceRestorer, RestorationArch, RestorationModel,
};
pub use nodes::{CropFaceNode, FaceRestoreNode, ModelLoaderNode, RestoreParams};
pub use registry::{DetectorProvider, ModelRegistry};
