use anyhow::{Context, Result};
use directories::ProjectDirs;
use facerestore_vision::DetectorKind;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "facerestore")
}

pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| match option_env!("FACERESTORE_CONFIG_PATH") {
    Some(path) => PathBuf::from(path),
    None => project_dirs()
        .map(|d| d.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("facerestore.toml")),
});

pub static DEFAULT_MODELS_DIR: Lazy<PathBuf> = Lazy::new(|| {
    project_dirs()
        .map(|d| d.data_dir().join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub models_dir: PathBuf,
    #[serde(
        serialize_with = "serialize_detector",
        deserialize_with = "deserialize_detector"
    )]
    pub facedetection: DetectorKind,
    pub codeformer_fidelity: f64,
    pub blend_factor: f32,
    pub blend_factor_unmasked: f32,
    pub inverse_mask: bool,
    pub detection_resize: u32,
    pub eye_dist_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models_dir: DEFAULT_MODELS_DIR.clone(),
            facedetection: DetectorKind::RetinafaceResnet50,
            codeformer_fidelity: 0.5,
            blend_factor: 1.0,
            blend_factor_unmasked: 0.0,
            inverse_mask: false,
            detection_resize: 640,
            eye_dist_threshold: 5.0,
        }
    }
}

fn serialize_detector<S: Serializer>(kind: &DetectorKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

fn deserialize_detector<'de, D: Deserializer<'de>>(d: D) -> Result<DetectorKind, D::Error> {
    let raw = String::deserialize(d)?;
    raw.parse().map_err(serde::de::Error::custom)
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
