use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{
    codecs::png::{CompressionType, FilterType, PngEncoder},
    ColorType, ImageEncoder,
};
use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const HISTORY_KEY: &str = "history";
pub const SETTINGS_KEY: &str = "settings";
pub const STYLES_KEY: &str = "styles";

pub const DEFAULT_MAX_HISTORY: usize = 50;
const APP_DIR_NAME: &str = "asset-forge";
const IMAGES_DIR_NAME: &str = "images";

const SUPPORTED_MIMES: [&str; 4] = ["image/png", "image/jpeg", "image/jpg", "image/webp"];

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub max_history: usize,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("ASSET_FORGE_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let max_history = std::env::var("ASSET_FORGE_MAX_HISTORY")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_HISTORY)
            .max(1);

        Self {
            data_dir,
            max_history,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub struct ParsedDataUrl {
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Keyed JSON records and managed image files under one data directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn open(root: impl Into<PathBuf>) -> AppResult<Self> {
        let storage = Self { root: root.into() };
        fs::create_dir_all(storage.images_dir())?;
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR_NAME)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// `Ok(None)` when nothing is stored under `key`; `StorageCorruption` when
    /// something is stored but does not parse.
    pub fn read_record<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)?;
        serde_json::from_str::<T>(&contents)
            .map(Some)
            .map_err(|error| AppError::StorageCorruption {
                key: key.to_string(),
                reason: error.to_string(),
            })
    }

    pub fn write_record<T: Serialize>(&self, key: &str, value: &T) -> AppResult<()> {
        write_json(&self.record_path(key), value)?;
        debug!("persisted {key}");
        Ok(())
    }

    pub fn remove_record(&self, key: &str) -> AppResult<()> {
        let path = self.record_path(key);
        if path.exists() {
            fs::remove_file(path)?;
            debug!("removed {key}");
        }
        Ok(())
    }

    /// Re-encodes the payload as an optimized PNG in the images directory and
    /// returns the path used as the record's image reference.
    pub fn store_image(&self, bytes: &[u8]) -> AppResult<String> {
        let image = image::load_from_memory(bytes)?.into_rgba8();
        let png_bytes = encode_png_optimized(image.as_raw(), image.width(), image.height())?;

        fs::create_dir_all(self.images_dir())?;
        let image_path = self.images_dir().join(format!("{}.png", Uuid::new_v4()));
        fs::write(&image_path, png_bytes)?;

        Ok(image_path.to_string_lossy().to_string())
    }

    /// Only `<images dir>/<uuid>.png` as written by `store_image` counts. Image
    /// references can come from imported files, so anything else is foreign.
    pub fn is_managed_image(&self, image_url: &str) -> bool {
        if image_url.starts_with("data:") {
            return false;
        }

        let path = Path::new(image_url);
        if path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return false;
        }

        let uuid_named = path.extension().and_then(|ext| ext.to_str()) == Some("png")
            && path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| Uuid::parse_str(stem).is_ok());

        uuid_named && path.parent() == Some(self.images_dir().as_path())
    }

    /// Deletes a managed image file. References outside the images directory are
    /// left alone.
    pub fn release_image(&self, image_url: &str) -> AppResult<()> {
        if !self.is_managed_image(image_url) {
            return Ok(());
        }

        let path = Path::new(image_url);
        if path.exists() {
            fs::remove_file(path)?;
            debug!("released image {}", path.display());
        }
        Ok(())
    }
}

/// Loads the bytes behind an image reference: a base64 data URL or a file path.
pub fn read_image_reference(reference: &str) -> AppResult<Vec<u8>> {
    if reference.starts_with("data:") {
        return parse_data_url(reference).map(|parsed| parsed.bytes);
    }

    let path = Path::new(reference);
    if !path.exists() {
        return Err(AppError::msg(format!(
            "image path not found: {}",
            path.display()
        )));
    }

    Ok(fs::read(path)?)
}

pub fn parse_data_url(data_url: &str) -> AppResult<ParsedDataUrl> {
    if !data_url.starts_with("data:") {
        return Err(AppError::msg("expected a data URL with image payload"));
    }

    let (metadata, payload) = data_url
        .split_once(',')
        .ok_or_else(|| AppError::msg("invalid data URL format"))?;

    if !metadata.contains(";base64") {
        return Err(AppError::msg("data URL must be base64 encoded"));
    }

    let mime = metadata
        .trim_start_matches("data:")
        .split(';')
        .next()
        .unwrap_or_default();
    if !SUPPORTED_MIMES.contains(&mime) {
        return Err(AppError::msg(format!(
            "unsupported image mime type: {mime}. allowed: png/jpeg/webp"
        )));
    }

    let bytes = STANDARD.decode(payload.trim())?;
    Ok(ParsedDataUrl {
        mime: mime.to_string(),
        bytes,
    })
}

pub fn to_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

fn encode_png_optimized(rgba: &[u8], width: u32, height: u32) -> AppResult<Vec<u8>> {
    let mut png_bytes = Vec::new();
    {
        let encoder = PngEncoder::new_with_quality(
            &mut png_bytes,
            CompressionType::Best,
            FilterType::Adaptive,
        );
        encoder
            .write_image(rgba, width, height, ColorType::Rgba8)
            .map_err(|error| AppError::msg(format!("failed to encode png: {error}")))?;
    }

    let mut options = oxipng::Options::from_preset(3);
    options.strip = oxipng::StripChunks::Safe;

    oxipng::optimize_from_memory(&png_bytes, &options)
        .map_err(|error| AppError::msg(format!("failed to optimize png: {error}")))
}

/// Writes through a sibling temp file and a rename so readers never see a
/// half-written document.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let contents = serde_json::to_string_pretty(value)?;
    write_bytes_atomic(path, contents.as_bytes())
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| AppError::msg(format!("invalid output path: {}", path.display())))?;
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    fs::write(&temp_path, bytes)?;
    if let Err(error) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(error.into());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn tiny_png() -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(2, 2, image::Rgba([200, 40, 40, 255]));
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(image.as_raw(), 2, 2, ColorType::Rgba8)
        .unwrap();
    bytes
}
