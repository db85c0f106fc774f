//! Input image normalization.

use crate::error::StageError;
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use recon_data::write_atomically;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const INPUT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
const JPEG_QUALITY: u8 = 95;

/// One normalized view, as listed in `work/inputs.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputView {
    pub id: usize,
    pub filename: String,
    /// Name of the original upload.
    pub source: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputManifest {
    pub run_id: String,
    pub root_path: PathBuf,
    pub views: Vec<InputView>,
}

/// JPEG and PNG files directly inside `dir`, sorted by file name.
pub fn list_input_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| INPUT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if supported && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

fn normalized_name(index: usize) -> String {
    format!("image_{index:03}.jpg")
}

/// Decode, bound, and re-encode one image as JPEG. Never upscales.
fn normalize_image(
    source: &Path,
    target: &Path,
    max_dimension: u32,
) -> Result<(u32, u32), StageError> {
    let mut img = image::open(source)?;
    if img.width().max(img.height()) > max_dimension {
        debug!(
            "Downscaling {} from {}x{}",
            source.display(),
            img.width(),
            img.height()
        );
        // `resize` fits within the box and keeps the aspect ratio.
        img = img.resize(max_dimension, max_dimension, FilterType::Lanczos3);
    }
    let rgb = img.to_rgb8();
    let writer = BufWriter::new(File::create(target)?);
    rgb.write_with_encoder(JpegEncoder::new_with_quality(writer, JPEG_QUALITY))?;
    Ok(rgb.dimensions())
}

/// Copies inputs into `work/images` as `image_NNN.jpg`, bounded to the
/// configured maximum dimension, and writes the input manifest.
pub struct PrepareInputs;

#[async_trait]
impl Stage for PrepareInputs {
    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        let layout = ctx.layout().clone();
        let config = ctx.config();
        let (min_images, max_images, max_dimension) =
            (config.min_images, config.max_images, config.max_image_dimension);

        let sources = list_input_images(&layout.input_dir)?;
        if sources.len() < min_images {
            return Err(StageError::Input(format!(
                "need at least {min_images} images, found {}",
                sources.len()
            )));
        }
        if sources.len() > max_images {
            return Err(StageError::Input(format!(
                "at most {max_images} images are supported, found {}",
                sources.len()
            )));
        }

        let total = sources.len();
        let mut views = Vec::with_capacity(total);
        for (id, source) in sources.into_iter().enumerate() {
            let filename = normalized_name(id);
            let target = layout.images_dir().join(&filename);
            let source_name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let decode_source = source.clone();
            let (width, height) = tokio::task::spawn_blocking(move || {
                normalize_image(&decode_source, &target, max_dimension)
            })
            .await
            .map_err(|e| StageError::Io(std::io::Error::other(e)))?
            .map_err(|e| match e {
                StageError::Image(err) => StageError::Input(format!(
                    "{} is not a readable image: {err}",
                    source.display()
                )),
                other => other,
            })?;

            views.push(InputView {
                id,
                filename,
                source: source_name,
                width,
                height,
            });
            let done = ((id + 1) * 100 / total) as u8;
            ctx.progress
                .report(done, format!("Prepared {}/{} images", id + 1, total))
                .await?;
        }

        let manifest = InputManifest {
            run_id: layout.run_id.clone(),
            root_path: layout.images_dir(),
            views,
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        write_atomically(&layout.manifest_path(), |file| file.write_all(&json))?;

        info!(
            "Prepared {} images (max dimension {})",
            manifest.views.len(),
            max_dimension
        );
        Ok(())
    }
}
