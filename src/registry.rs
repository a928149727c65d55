use anyhow::{Context, Result};
use facerestore_vision::{DetectorKind, FaceDetector, OnnxFaceDetector};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const FACERESTORE_MODELS: &str = "facerestore_models";
pub const FACEDETECTION_MODELS: &str = "facedetection_models";

/// Extensions the ONNX runtime can load.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["onnx"];

/// Source of face detectors for a given detector identifier.
pub trait DetectorProvider {
    fn detector(&self, kind: DetectorKind) -> Result<Box<dyn FaceDetector>>;
}

/// Named model folders under one models directory.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models_dir: PathBuf,
    folders: BTreeMap<&'static str, PathBuf>,
}

impl ModelRegistry {
    /// Register the restoration and detection folders, creating them if needed.
    pub fn register(models_dir: &Path) -> Result<Self> {
        let mut folders = BTreeMap::new();
        for (name, dir) in [
            (FACERESTORE_MODELS, "facerestore_models"),
            (FACEDETECTION_MODELS, "facedetection"),
        ] {
            let path = models_dir.join(dir);
            std::fs::create_dir_all(&path)
                .with_context(|| format!("creating model folder {}", path.display()))?;
            folders.insert(name, path);
        }
        Ok(Self {
            models_dir: models_dir.to_path_buf(),
            folders,
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn folder(&self, name: &str) -> Result<&Path> {
        self.folders
            .get(name)
            .map(PathBuf::as_path)
            .with_context(|| format!("unknown model folder '{}'", name))
    }

    /// Sorted, `/`-separated paths of loadable files, relative to the folder.
    pub fn get_filename_list(&self, name: &str) -> Result<Vec<String>> {
        let root = self.folder(name)?;
        let mut files = Vec::new();
        collect_models(root, root, &mut files)?;
        files.sort();
        Ok(files)
    }

    pub fn get_full_path(&self, name: &str, filename: &str) -> Result<PathBuf> {
        let path = self.folder(name)?.join(filename);
        anyhow::ensure!(path.is_file(), "model file not found: {}", path.display());
        Ok(path)
    }
}

impl DetectorProvider for ModelRegistry {
    fn detector(&self, kind: DetectorKind) -> Result<Box<dyn FaceDetector>> {
        let path = self.get_full_path(FACEDETECTION_MODELS, kind.model_filename())?;
        Ok(Box::new(OnnxFaceDetector::load(kind, &path)?))
    }
}

fn collect_models(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_models(root, &path, out)?;
            continue;
        }
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()));
        if !supported {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(root) {
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(parts.join("/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        ModelRegistry::register(dir.path()).unwrap();
        let reg = ModelRegistry::register(dir.path()).unwrap();
        assert!(dir.path().join("facerestore_models").is_dir());
        assert!(dir.path().join("facedetection").is_dir());
        assert_eq!(reg.models_dir(), dir.path());
    }

    #[test]
    fn lists_only_onnx_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::register(dir.path()).unwrap();
        let root = reg.folder(FACERESTORE_MODELS).unwrap().to_path_buf();
        std::fs::create_dir_all(root.join("v2")).unwrap();
        std::fs::write(root.join("codeformer.onnx"), b"").unwrap();
        std::fs::write(root.join("v2").join("GFPGANv1.4.ONNX"), b"").unwrap();
        std::fs::write(root.join("notes.txt"), b"").unwrap();

        let files = reg.get_filename_list(FACERESTORE_MODELS).unwrap();
        assert_eq!(files, vec!["codeformer.onnx", "v2/GFPGANv1.4.ONNX"]);
        assert!(reg.get_filename_list(FACEDETECTION_MODELS).unwrap().is_empty());
    }

    #[test]
    fn full_path_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::register(dir.path()).unwrap();
        assert!(reg.get_full_path(FACERESTORE_MODELS, "missing.onnx").is_err());
        assert!(reg.get_full_path("upscale_models", "x.onnx").is_err());
        assert!(reg.detector(DetectorKind::Yolov5n).is_err());
    }
}
