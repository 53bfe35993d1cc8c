use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use log::{debug, warn};

use crate::{
    error::{AppError, AppResult},
    storage::{self, Storage},
};

pub const NEGATIVE_PROMPT: &str = "low quality, blurry, bad anatomy, watermark, signature, text";

const BUILTIN_STYLES: [(&str, &str); 8] = [
    ("realistic", "photorealistic, highly detailed, 8k resolution"),
    ("anime", "anime style, cel shaded, vibrant colors"),
    ("pixel", "pixel art style, retro gaming, 16-bit"),
    ("lowpoly", "low poly 3D style, geometric, minimalist"),
    ("handdrawn", "hand drawn, sketch style, artistic"),
    ("scifi", "science fiction, futuristic, high-tech, sleek"),
    ("fantasy", "fantasy style, magical, mystical, ethereal"),
    ("cyberpunk", "cyberpunk style, neon, dystopian, high-tech-low-life"),
];

pub const EXAMPLE_PROMPTS: [&str; 8] = [
    "A mystical staff with floating crystals and ethereal energy",
    "A futuristic hover bike with neon accents",
    "A medieval castle with dragon-themed architecture",
    "A cyberpunk samurai warrior with glowing armor",
    "A magical potion bottle with swirling rainbow liquid",
    "An ancient tree with glowing runes carved into its bark",
    "A steampunk mechanical dragon with brass gears",
    "A crystal cave with bioluminescent plants",
];

pub fn example_prompt(seed: u64) -> &'static str {
    EXAMPLE_PROMPTS[(seed % EXAMPLE_PROMPTS.len() as u64) as usize]
}

#[derive(Debug, Default)]
struct CatalogInner {
    presets: BTreeMap<String, String>,
    custom: BTreeMap<String, String>,
}

/// Shared handle to the live catalog. Clones see the same presets.
#[derive(Debug, Clone)]
pub struct StyleCatalog {
    inner: Arc<RwLock<CatalogInner>>,
    storage: Option<Storage>,
}

impl Default for StyleCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StyleCatalog {
    /// Catalog with only the built-in presets and no persistence.
    pub fn builtin() -> Self {
        let presets = BUILTIN_STYLES
            .iter()
            .map(|(key, fragment)| (key.to_string(), fragment.to_string()))
            .collect();

        Self {
            inner: Arc::new(RwLock::new(CatalogInner {
                presets,
                custom: BTreeMap::new(),
            })),
            storage: None,
        }
    }

    /// Built-in presets overlaid with the persisted custom presets. A corrupt overlay
    /// is logged and ignored.
    pub fn load(storage: &Storage) -> Self {
        let mut catalog = Self::builtin();
        catalog.storage = Some(storage.clone());

        match storage.read_record::<BTreeMap<String, String>>(storage::STYLES_KEY) {
            Ok(Some(custom)) => {
                debug!("loaded {} custom style presets", custom.len());
                let mut inner = catalog.write();
                inner.presets.extend(custom.clone());
                inner.custom = custom;
            }
            Ok(None) => {}
            Err(error) => warn!("ignoring custom style presets: {error}"),
        }

        catalog
    }

    pub fn fragment(&self, key: &str) -> AppResult<String> {
        self.read()
            .presets
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::UnknownStyle(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().presets.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().presets.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read().presets.clone()
    }

    /// Adds or overwrites presets. The overlay is persisted before the live catalog
    /// changes so a failed write leaves both untouched.
    pub fn merge_styles(&self, patch: &BTreeMap<String, String>) -> AppResult<usize> {
        if patch.is_empty() {
            return Ok(0);
        }

        let mut inner = self.write();
        let mut custom = inner.custom.clone();
        custom.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(storage) = &self.storage {
            storage.write_record(storage::STYLES_KEY, &custom)?;
        }

        inner
            .presets
            .extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        inner.custom = custom;
        debug!("merged {} style presets", patch.len());
        Ok(patch.len())
    }

    /// The custom presets layered over the built-ins.
    pub fn overlay(&self) -> BTreeMap<String, String> {
        self.read().custom.clone()
    }

    /// Puts back an overlay captured with `overlay()`, undoing later merges.
    pub fn restore_overlay(&self, previous: BTreeMap<String, String>) -> AppResult<()> {
        let mut inner = self.write();

        if let Some(storage) = &self.storage {
            if previous.is_empty() {
                storage.remove_record(storage::STYLES_KEY)?;
            } else {
                storage.write_record(storage::STYLES_KEY, &previous)?;
            }
        }

        let mut presets: BTreeMap<String, String> = BUILTIN_STYLES
            .iter()
            .map(|(key, fragment)| (key.to_string(), fragment.to_string()))
            .collect();
        presets.extend(previous.clone());
        inner.presets = presets;
        inner.custom = previous;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, CatalogInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
