use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facerestore::registry::{FACEDETECTION_MODELS, FACERESTORE_MODELS};
use facerestore::{
    config, nodes, CropFaceNode, DetectorKind, FaceRestoreNode, FaceRestorer, ModelLoaderNode,
    ModelRegistry, RestoreParams,
};
use image::RgbImage;
use log::info;
use ndarray::{Array2, Array4, ArrayView3};

#[derive(Parser)]
#[command(name = "facerestore")]
#[command(version, about = "Face restoration with CodeFormer-style ONNX models")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore faces in images and blend them back
    Restore {
        /// Input images
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Output directory
        #[arg(short, long, default_value = "restored")]
        output: PathBuf,
        /// Restoration model file in the facerestore_models folder
        #[arg(short, long)]
        model: String,
        /// Face detector (overrides config)
        #[arg(short, long)]
        detector: Option<DetectorKind>,
        /// CodeFormer fidelity weight (overrides config)
        #[arg(long)]
        fidelity: Option<f64>,
        /// Blend factor inside the mask (overrides config)
        #[arg(long)]
        blend: Option<f32>,
        /// Blend factor outside the mask (overrides config)
        #[arg(long)]
        blend_unmasked: Option<f32>,
        /// Grayscale mask image, same size as every input
        #[arg(long)]
        mask: Option<PathBuf>,
        /// Swap the masked and unmasked regions
        #[arg(long)]
        inverse_mask: bool,
    },
    /// Save aligned 512x512 face crops
    Crop {
        /// Input images
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Output directory
        #[arg(short, long, default_value = "faces")]
        output: PathBuf,
        /// Face detector (overrides config)
        #[arg(short, long)]
        detector: Option<DetectorKind>,
    },
    /// List model files in the registered folders
    Models,
    /// Print node declarations as JSON
    Nodes,
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    let registry = ModelRegistry::register(&cfg.models_dir)
        .context("Failed to register model folders")?;

    match cli.command {
        Commands::Restore {
            inputs,
            output,
            model,
            detector,
            fidelity,
            blend,
            blend_unmasked,
            mask,
            inverse_mask,
        } => {
            let mut params = RestoreParams::from(&cfg);
            params.codeformer_fidelity = fidelity.unwrap_or(params.codeformer_fidelity);
            params.blend_factor = blend.unwrap_or(params.blend_factor);
            params.blend_factor_unmasked = blend_unmasked.unwrap_or(params.blend_factor_unmasked);
            params.inverse_mask |= inverse_mask;
            let detector = detector.unwrap_or(cfg.facedetection);
            restore(&registry, &inputs, &output, &model, detector, params, mask.as_deref())
        }
        Commands::Crop {
            inputs,
            output,
            detector,
        } => crop(
            &registry,
            &cfg,
            &inputs,
            &output,
            detector.unwrap_or(cfg.facedetection),
        ),
        Commands::Models => list_models(&registry),
        Commands::Nodes => {
            let specs = nodes::node_specs(&registry)?;
            println!("{}", serde_json::to_string_pretty(&specs)?);
            Ok(())
        }
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

fn restore(
    registry: &ModelRegistry,
    inputs: &[PathBuf],
    output: &Path,
    model_name: &str,
    detector: DetectorKind,
    params: RestoreParams,
    mask: Option<&Path>,
) -> Result<()> {
    let mut model = ModelLoaderNode
        .load_model(registry, model_name)
        .context("Failed to load restoration model")?;
    let mask = mask.map(load_mask).transpose()?;
    let mut node = FaceRestoreNode::new();
    std::fs::create_dir_all(output)?;

    for input in inputs {
        info!("Restoring {}", input.display());
        let batch = load_batch(input)?;
        let restored = node.restore_face(
            registry,
            Some(&mut model as &mut dyn FaceRestorer),
            batch.view(),
            detector,
            params,
            mask.as_ref().map(|m| m.view()),
        )?;
        let out_path = output.join(file_name(input, "png"));
        save_rgb(restored.index_axis(ndarray::Axis(0), 0), &out_path)?;
        info!("✓ Saved {}", out_path.display());
    }
    Ok(())
}

fn crop(
    registry: &ModelRegistry,
    cfg: &config::Config,
    inputs: &[PathBuf],
    output: &Path,
    detector: DetectorKind,
) -> Result<()> {
    let mut node = CropFaceNode::from_config(cfg);
    std::fs::create_dir_all(output)?;

    for input in inputs {
        let batch = load_batch(input)?;
        let faces = node.crop_face(registry, batch.view(), detector)?;
        info!("{}: {} face slot(s)", input.display(), faces.shape()[0]);
        let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
        for (idx, face) in faces.outer_iter().enumerate() {
            let out_path = output.join(format!("{}_face{}.png", stem, idx));
            save_rgb(face, &out_path)?;
        }
    }
    Ok(())
}

fn list_models(registry: &ModelRegistry) -> Result<()> {
    for name in [FACERESTORE_MODELS, FACEDETECTION_MODELS] {
        let folder = registry.folder(name)?;
        info!("{} ({})", name, folder.display());
        for file in registry.get_filename_list(name)? {
            println!("{}/{}", name, file);
        }
    }
    Ok(())
}

/// One image as a `[1, H, W, 3]` RGB batch in `[0, 1]`.
fn load_batch(path: &Path) -> Result<Array4<f32>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .to_rgb8();
    let (w, h) = img.dimensions();
    let data: Vec<f32> = img.into_raw().into_iter().map(|v| f32::from(v) / 255.0).collect();
    Ok(Array4::from_shape_vec((1, h as usize, w as usize, 3), data)?)
}

fn load_mask(path: &Path) -> Result<Array2<f32>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open mask {}", path.display()))?
        .to_luma8();
    let (w, h) = img.dimensions();
    let data: Vec<f32> = img.into_raw().into_iter().map(|v| f32::from(v) / 255.0).collect();
    Ok(Array2::from_shape_vec((h as usize, w as usize), data)?)
}

fn save_rgb(img: ArrayView3<'_, f32>, path: &Path) -> Result<()> {
    let (h, w, _) = img.dim();
    let raw: Vec<u8> = img
        .iter()
        .map(|&v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect();
    let buf = RgbImage::from_raw(w as u32, h as u32, raw).context("image buffer size mismatch")?;
    buf.save(path)
        .with_context(|| format!("Failed to save {}", path.display()))
}

fn file_name(input: &Path, ext: &str) -> String {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    format!("{}.{}", stem, ext)
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
