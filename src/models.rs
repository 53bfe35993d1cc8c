use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Character,
    Item,
    Environment,
    Weapon,
    Vehicle,
    Building,
    Creature,
    Prop,
}

impl AssetType {
    pub const ALL: [AssetType; 8] = [
        Self::Character,
        Self::Item,
        Self::Environment,
        Self::Weapon,
        Self::Vehicle,
        Self::Building,
        Self::Creature,
        Self::Prop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Item => "item",
            Self::Environment => "environment",
            Self::Weapon => "weapon",
            Self::Vehicle => "vehicle",
            Self::Building => "building",
            Self::Creature => "creature",
            Self::Prop => "prop",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                AppError::msg(format!(
                    "unknown asset type: {value}. allowed: {}",
                    Self::ALL.map(|kind| kind.as_str()).join(", ")
                ))
            })
    }
}

/// One generated asset as kept in the history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub prompt: String,
    pub asset_type: AssetType,
    pub style_preset: String,
    pub image_url: String,
    pub timestamp: i64,
    #[serde(default)]
    pub name: String,
}

impl AssetRecord {
    pub fn derive_name(asset_type: AssetType, timestamp: i64) -> String {
        format!("{asset_type}-{timestamp}.png")
    }

    pub fn to_request(&self) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt.clone(),
            asset_type: self.asset_type,
            style_preset: self.style_preset.clone(),
        }
    }
}

/// Candidate for insertion; `name` and `timestamp` are filled in by the store when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetData {
    pub prompt: String,
    pub asset_type: AssetType,
    pub style_preset: String,
    pub image_url: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<AssetRecord> for AssetData {
    fn from(record: AssetRecord) -> Self {
        Self {
            prompt: record.prompt,
            asset_type: record.asset_type,
            style_preset: record.style_preset,
            image_url: record.image_url,
            timestamp: Some(record.timestamp),
            name: Some(record.name).filter(|name| !name.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    pub asset_type: AssetType,
    pub style_preset: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryFilter {
    All,
    Only(AssetType),
}

impl HistoryFilter {
    pub fn matches(&self, record: &AssetRecord) -> bool {
        match self {
            Self::All => true,
            Self::Only(kind) => record.asset_type == *kind,
        }
    }
}

impl FromStr for HistoryFilter {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            value.parse().map(Self::Only)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub api_token: String,
    pub default_style: String,
    pub default_asset_type: AssetType,
    pub auto_save: bool,
    pub dark_mode: bool,
    pub quality: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            default_style: "realistic".to_string(),
            default_asset_type: AssetType::Character,
            auto_save: true,
            dark_mode: true,
            quality: "high".to_string(),
        }
    }
}

impl Settings {
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(api_token) = patch.api_token {
            self.api_token = api_token;
        }
        if let Some(default_style) = patch.default_style {
            self.default_style = default_style;
        }
        if let Some(default_asset_type) = patch.default_asset_type {
            self.default_asset_type = default_asset_type;
        }
        if let Some(auto_save) = patch.auto_save {
            self.auto_save = auto_save;
        }
        if let Some(dark_mode) = patch.dark_mode {
            self.dark_mode = dark_mode;
        }
        if let Some(quality) = patch.quality {
            self.quality = quality;
        }
    }
}

/// Field-by-field settings update; absent fields leave the current value alone.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub api_token: Option<String>,
    pub default_style: Option<String>,
    pub default_asset_type: Option<AssetType>,
    pub auto_save: Option<bool>,
    pub dark_mode: Option<bool>,
    pub quality: Option<String>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainBundle {
    pub version: String,
    pub timestamp: i64,
    pub history: Vec<AssetRecord>,
    pub settings: Settings,
}

/// Read side of the plain bundle. Required fields are checked by the importer so a
/// document missing them is reported as a format problem, not a parse error.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PlainBundleImport {
    pub version: Option<String>,
    pub timestamp: Option<i64>,
    pub history: Option<Vec<AssetRecord>>,
    pub settings: Option<SettingsPatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceTags {
    pub ai_generated: bool,
    pub model: String,
    pub category: String,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub style: String,
    pub prompt: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub cursor_metadata: Option<ProvenanceTags>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    pub path: String,
    pub metadata: AssetMetadata,
    #[serde(default)]
    pub preview: Option<String>,
}

impl ManifestAsset {
    pub fn usable_preview(&self) -> Option<&str> {
        self.preview.as_deref().filter(|preview| !preview.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AiSettings {
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub style_presets: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub settings: AiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackagedManifest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub project_type: String,
    #[serde(default)]
    pub assets: Vec<ManifestAsset>,
    #[serde(default)]
    pub ai_config: Option<AiConfig>,
}

/// The `.json` file written next to an image by the editor command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SidecarMetadata {
    pub prompt: String,
    pub asset_type: AssetType,
    pub style_preset: String,
    pub timestamp: i64,
    pub enhanced_prompt: String,
    pub cursor_metadata: ProvenanceTags,
}
