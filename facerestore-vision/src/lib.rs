pub mod align;
pub mod composite;
pub mod face;
pub mod helper;
pub mod model;
pub mod retinaface;
pub mod slots;
pub mod tensor;
pub mod yolov5face;

// Re-export commonly used types
pub use composite::BlendFactors;
pub use face::{Detection, DetectorKind, FaceDetector, OnnxFaceDetector};
pub use helper::{FaceRestoreHelper, LandmarkOptions};
pub use model::{FaceRestorer, RestorationArch, RestorationModel, FACE_SIZE};
pub use slots::FaceSlots;
pub use tensor::BridgeError;
