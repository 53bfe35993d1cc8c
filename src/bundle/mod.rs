use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{
    catalog::{StyleCatalog, NEGATIVE_PROMPT},
    error::{AppError, AppResult},
    inference::PROVIDER,
    models::{
        AiConfig, AiSettings, AssetData, AssetMetadata, AssetRecord, AssetType,
        GenerationRequest, ManifestAsset, PackagedManifest, ProvenanceTags, SidecarMetadata,
    },
    prompt,
    storage::{self, read_image_reference},
    store::AssetStore,
};

pub const MANIFEST_FILE: &str = "cursor-assets.json";
pub const DEFAULT_ASSET_FOLDER: &str = "assets/generated";

const MANIFEST_VERSION: &str = "1.0";
const PROJECT_TYPE: &str = "game-assets";
const CATEGORY: &str = "game-asset";
const PROVENANCE_VERSION: &str = "1.0";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

pub fn provenance(model: &str, asset_type: AssetType, style_preset: &str) -> ProvenanceTags {
    ProvenanceTags {
        ai_generated: true,
        model: model.to_string(),
        category: CATEGORY.to_string(),
        tags: prompt::tags_for(asset_type, style_preset),
        version: None,
    }
}

pub fn asset_metadata(record: &AssetRecord, model: &str) -> AssetMetadata {
    let mut tags = provenance(model, record.asset_type, &record.style_preset);
    tags.version = Some(PROVENANCE_VERSION.to_string());

    AssetMetadata {
        name: Some(record.name.clone()),
        asset_type: record.asset_type,
        style: record.style_preset.clone(),
        prompt: record.prompt.clone(),
        timestamp: Some(record.timestamp),
        cursor_metadata: Some(tags),
    }
}

pub fn build_manifest(
    records: &[AssetRecord],
    asset_folder: &str,
    model: &str,
    catalog: &StyleCatalog,
) -> PackagedManifest {
    let folder = asset_folder.trim_matches('/');
    let mut used = HashSet::new();

    let assets = records
        .iter()
        .map(|record| ManifestAsset {
            path: unique_path(&mut used, folder, &entry_file_name(record)),
            metadata: asset_metadata(record, model),
            preview: Some(record.image_url.clone()),
        })
        .collect();

    PackagedManifest {
        version: MANIFEST_VERSION.to_string(),
        project_type: PROJECT_TYPE.to_string(),
        assets,
        ai_config: Some(AiConfig {
            provider: PROVIDER.to_string(),
            model: model.to_string(),
            settings: AiSettings {
                negative_prompt: Some(NEGATIVE_PROMPT.to_string()),
                style_presets: Some(catalog.snapshot()),
            },
        }),
    }
}

/// Record names can come from imported files; only the final path segment is kept
/// so an entry never lands outside the asset folder.
fn entry_file_name(record: &AssetRecord) -> String {
    let base = record
        .name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base.chars().all(|c| c == '.') {
        AssetRecord::derive_name(record.asset_type, record.timestamp)
    } else {
        base.to_string()
    }
}

/// Names are not unique across imports, so archive paths get a numeric suffix on
/// collision.
fn unique_path(used: &mut HashSet<String>, folder: &str, name: &str) -> String {
    let base = if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    };
    if used.insert(base.clone()) {
        return base;
    }

    let (stem, extension) = match base.rsplit_once('.') {
        Some((stem, extension)) if !stem.ends_with('/') => {
            (stem.to_string(), format!(".{extension}"))
        }
        _ => (base.clone(), String::new()),
    };
    let mut counter = 1;
    loop {
        let candidate = format!("{stem}-{counter}{extension}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Builds the archive in memory. Every payload is fetched before anything is
/// written, so one unreadable asset aborts the whole export.
pub fn export_packaged(
    records: &[AssetRecord],
    asset_folder: &str,
    model: &str,
    catalog: &StyleCatalog,
) -> AppResult<Vec<u8>> {
    let manifest = build_manifest(records, asset_folder, model, catalog);

    let payloads = records
        .iter()
        .map(|record| {
            read_image_reference(&record.image_url).map_err(|error| AppError::Export {
                asset: record.name.clone(),
                reason: error.to_string(),
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    let manifest_json = serde_json::to_string_pretty(&manifest)?;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(MANIFEST_FILE, entry_options())?;
    writer.write_all(manifest_json.as_bytes())?;

    for (asset, bytes) in manifest.assets.iter().zip(&payloads) {
        writer.start_file(asset.path.as_str(), entry_options())?;
        writer.write_all(bytes)?;
    }

    let archive = writer.finish()?.into_inner();
    info!(
        "packaged {} assets ({} bytes)",
        manifest.assets.len(),
        archive.len()
    );
    Ok(archive)
}

/// A parsed packaged import, with whatever binary entries the archive carried.
#[derive(Debug)]
pub struct PackagedImport {
    pub manifest: PackagedManifest,
    pub payloads: HashMap<String, Vec<u8>>,
}

pub fn read_packaged(bytes: &[u8]) -> AppResult<PackagedImport> {
    if bytes.starts_with(ZIP_MAGIC) {
        read_archive(bytes)
    } else {
        let contents = std::str::from_utf8(bytes)
            .map_err(|_| AppError::format("packaged import is neither a zip archive nor JSON"))?;
        Ok(PackagedImport {
            manifest: parse_manifest(contents)?,
            payloads: HashMap::new(),
        })
    }
}

pub fn parse_manifest(contents: &str) -> AppResult<PackagedManifest> {
    serde_json::from_str(contents).map_err(|error| AppError::format(error.to_string()))
}

fn read_archive(bytes: &[u8]) -> AppResult<PackagedImport> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let mut contents = String::new();
    archive
        .by_name(MANIFEST_FILE)
        .map_err(|_| AppError::format(format!("archive has no {MANIFEST_FILE}")))?
        .read_to_string(&mut contents)?;
    let manifest = parse_manifest(&contents)?;

    let mut payloads = HashMap::new();
    for asset in &manifest.assets {
        if let Ok(mut file) = archive.by_name(&asset.path) {
            let mut buffer = Vec::new();
            file.read_to_end(&mut buffer)?;
            payloads.insert(asset.path.clone(), buffer);
        }
    }

    debug!(
        "archive carries {} of {} asset payloads",
        payloads.len(),
        manifest.assets.len()
    );
    Ok(PackagedImport { manifest, payloads })
}

/// Merges the package's style presets into the catalog and inserts one record per
/// asset entry that has a usable preview. When the archive carried the binary at
/// the entry's path it is copied into managed storage and used instead of the
/// preview reference.
pub fn import_packaged(
    store: &mut AssetStore,
    catalog: &StyleCatalog,
    package: PackagedImport,
) -> AppResult<usize> {
    let PackagedImport { manifest, payloads } = package;

    let mut stored_images = Vec::new();
    let mut candidates = Vec::new();
    for asset in &manifest.assets {
        let Some(preview) = asset.usable_preview() else {
            debug!("skipping {} without a preview", asset.path);
            continue;
        };

        let image_url = match payloads.get(&asset.path) {
            Some(bytes) => match store.storage().store_image(bytes) {
                Ok(path) => {
                    stored_images.push(path.clone());
                    path
                }
                Err(error) => {
                    warn!("archive entry {} is not a usable image: {error}", asset.path);
                    preview.to_string()
                }
            },
            None => preview.to_string(),
        };

        candidates.push(AssetData {
            prompt: asset.metadata.prompt.clone(),
            asset_type: asset.metadata.asset_type,
            style_preset: asset.metadata.style.clone(),
            image_url,
            timestamp: asset.metadata.timestamp,
            name: asset.metadata.name.clone(),
        });
    }

    let release_stored = |store: &AssetStore| {
        for path in &stored_images {
            let _ = store.storage().release_image(path);
        }
    };

    let overlay_before = catalog.overlay();
    let mut merged = false;
    if let Some(presets) = manifest
        .ai_config
        .as_ref()
        .and_then(|config| config.settings.style_presets.as_ref())
    {
        if let Err(error) = catalog.merge_styles(presets) {
            release_stored(&*store);
            return Err(error);
        }
        merged = !presets.is_empty();
    }

    match store.insert_many(candidates) {
        Ok(inserted) => {
            info!("imported {} packaged assets", inserted.len());
            Ok(inserted.len())
        }
        Err(error) => {
            release_stored(&*store);
            if merged {
                if let Err(restore_error) = catalog.restore_overlay(overlay_before) {
                    warn!("failed to roll back merged style presets: {restore_error}");
                }
            }
            Err(error)
        }
    }
}

/// Writes `{type}-{timestamp}.png` with the raw payload and a `.json` sidecar next
/// to it. Returns both paths.
pub fn write_asset_pair(
    output_dir: &Path,
    request: &GenerationRequest,
    enhanced_prompt: &str,
    model: &str,
    bytes: &[u8],
    timestamp: i64,
) -> AppResult<(PathBuf, PathBuf)> {
    let image_path = output_dir.join(AssetRecord::derive_name(request.asset_type, timestamp));
    let sidecar_path = image_path.with_extension("json");

    let sidecar = SidecarMetadata {
        prompt: request.prompt.clone(),
        asset_type: request.asset_type,
        style_preset: request.style_preset.clone(),
        timestamp,
        enhanced_prompt: enhanced_prompt.to_string(),
        cursor_metadata: provenance(model, request.asset_type, &request.style_preset),
    };

    storage::write_bytes_atomic(&image_path, bytes)?;
    if let Err(error) = storage::write_json(&sidecar_path, &sidecar) {
        let _ = fs::remove_file(&image_path);
        return Err(error);
    }

    Ok((image_path, sidecar_path))
}
