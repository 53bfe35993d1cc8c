use std::{fs, path::PathBuf};

use clap::{Parser, Subcommand};
use log::{debug, info};

use crate::{
    bundle,
    catalog,
    error::{AppError, AppResult},
    inference::InferenceConfig,
    models::{AssetRecord, AssetType, GenerationRequest, HistoryFilter, Settings, SettingsPatch},
    storage::{self, StorageConfig},
    store,
    studio::Studio,
};

#[derive(Parser, Debug)]
#[command(name = "asset-forge")]
#[command(about = "Generate game assets from text prompts and manage their history", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Data directory holding history, settings and managed images
    #[arg(long, value_name = "DIR", global = true, env = "ASSET_FORGE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Maximum number of records kept in the history
    #[arg(long, value_name = "N", global = true, env = "ASSET_FORGE_MAX_HISTORY")]
    pub max_history: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate an asset and add it to the history
    Generate {
        /// Description of the asset
        prompt: Option<String>,

        /// Asset type (defaults to the configured default type)
        #[arg(long = "type")]
        asset_type: Option<AssetType>,

        /// Style preset key (defaults to the configured default style)
        #[arg(long)]
        style: Option<String>,

        /// Inference API token (falls back to the stored token, then HF_API_TOKEN)
        #[arg(long)]
        token: Option<String>,

        /// Use a random example prompt
        #[arg(long, conflicts_with = "prompt")]
        random: bool,
    },

    /// Generate again from the record at INDEX
    Regenerate {
        index: usize,

        #[arg(long)]
        token: Option<String>,
    },

    /// List the history, most recent first
    History {
        /// Asset type or "all"
        #[arg(long, default_value = "all")]
        filter: HistoryFilter,
    },

    /// Remove the record at INDEX
    Remove { index: usize },

    /// Remove every record
    Clear {
        /// Confirm the removal
        #[arg(long)]
        yes: bool,
    },

    /// Export history and settings as plain JSON
    Export { file: PathBuf },

    /// Import a plain JSON export
    Import { file: PathBuf },

    /// Export assets as a zip archive with an editor manifest
    ExportPackaged {
        file: PathBuf,

        #[arg(long, default_value = "all")]
        filter: HistoryFilter,

        /// Folder the assets are placed under inside the archive
        #[arg(long, default_value = bundle::DEFAULT_ASSET_FOLDER)]
        folder: String,
    },

    /// Import a packaged archive or a bare manifest
    ImportPackaged { file: PathBuf },

    /// List the available style presets
    Styles,

    /// Generate into a directory as a `.png` and `.json` pair, without touching the history
    Emit {
        prompt: String,

        #[arg(long = "type", default_value = "character")]
        asset_type: AssetType,

        #[arg(long, default_value = "realistic")]
        style: String,

        #[arg(long)]
        token: Option<String>,

        /// Output directory
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },

    /// Show or update settings
    Settings {
        #[arg(long)]
        token: Option<String>,

        #[arg(long)]
        default_style: Option<String>,

        #[arg(long)]
        default_type: Option<AssetType>,

        #[arg(long)]
        auto_save: Option<bool>,

        #[arg(long)]
        dark_mode: Option<bool>,

        #[arg(long)]
        quality: Option<String>,
    },
}

pub async fn execute(cli: Cli) -> AppResult<()> {
    let mut storage_config = StorageConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        storage_config.data_dir = data_dir;
    }
    if let Some(max_history) = cli.max_history {
        storage_config.max_history = max_history.max(1);
    }

    let studio = Studio::open(&storage_config, &InferenceConfig::from_env())?;
    studio.subscribe(|records| debug!("history now holds {} records", records.len()));

    match cli.command {
        Command::Generate {
            prompt,
            asset_type,
            style,
            token,
            random,
        } => {
            let settings = studio.settings();
            let prompt = if random {
                catalog::example_prompt(store::now_millis().unsigned_abs()).to_string()
            } else {
                prompt.unwrap_or_default()
            };
            let request = GenerationRequest {
                prompt,
                asset_type: asset_type.unwrap_or(settings.default_asset_type),
                style_preset: style.unwrap_or(settings.default_style),
            };
            let token = studio.resolve_token(token.as_deref());
            report_generation(studio.generate(&request, &token).await?)?;
        }
        Command::Regenerate { index, token } => {
            let request = studio.reuse(index)?;
            let token = studio.resolve_token(token.as_deref());
            report_generation(studio.generate(&request, &token).await?)?;
        }
        Command::History { filter } => {
            if studio.filter(filter).is_empty() {
                println!("No assets yet.");
            }
            // Indices refer to positions in the full history so they can be passed to
            // `remove` and `regenerate` unchanged.
            for (index, record) in studio.records().iter().enumerate() {
                if filter.matches(record) {
                    print_record(index, record);
                }
            }
        }
        Command::Remove { index } => {
            let removed = studio.remove(index)?;
            println!("Removed {}", removed.name);
        }
        Command::Clear { yes } => {
            if !yes {
                return Err(AppError::msg("refusing to clear the history without --yes"));
            }
            studio.clear()?;
            println!("History cleared.");
        }
        Command::Export { file } => {
            let bundle = studio.export_plain();
            storage::write_json(&file, &bundle)?;
            info!("exported {} records to {}", bundle.history.len(), file.display());
            println!("Exported {} assets to {}", bundle.history.len(), file.display());
        }
        Command::Import { file } => {
            let contents = fs::read_to_string(&file)?;
            let count = studio.import_plain(&contents)?;
            println!("Imported {count} assets.");
        }
        Command::ExportPackaged {
            file,
            filter,
            folder,
        } => {
            let archive = studio.export_packaged(filter, &folder)?;
            storage::write_bytes_atomic(&file, &archive)?;
            info!("wrote packaged export to {}", file.display());
            println!("Exported package to {}", file.display());
        }
        Command::ImportPackaged { file } => {
            let bytes = fs::read(&file)?;
            let count = studio.import_packaged(&bytes)?;
            println!("Imported {count} assets.");
        }
        Command::Styles => {
            for (key, fragment) in studio.catalog().snapshot() {
                println!("{key:<12} {fragment}");
            }
        }
        Command::Emit {
            prompt,
            asset_type,
            style,
            token,
            out,
        } => {
            let request = GenerationRequest {
                prompt,
                asset_type,
                style_preset: style,
            };
            let token = studio.resolve_token(token.as_deref());
            let (image, sidecar) = studio
                .generate_to_directory(&request, &token, &out)
                .await?
                .ok_or(AppError::GenerationInProgress)?;
            println!("{}", image.display());
            println!("{}", sidecar.display());
        }
        Command::Settings {
            token,
            default_style,
            default_type,
            auto_save,
            dark_mode,
            quality,
        } => {
            let patch = SettingsPatch {
                api_token: token,
                default_style,
                default_asset_type: default_type,
                auto_save,
                dark_mode,
                quality,
            };
            let settings = if patch.is_empty() {
                studio.settings()
            } else {
                studio.update_settings(patch)?
            };
            print_settings(&settings);
        }
    }

    Ok(())
}

fn report_generation(record: Option<AssetRecord>) -> AppResult<()> {
    let record = record.ok_or(AppError::GenerationInProgress)?;
    println!("Generated {} -> {}", record.name, record.image_url);
    Ok(())
}

fn print_record(index: usize, record: &AssetRecord) {
    println!(
        "[{index}] {} ({}, {}) {}",
        record.name, record.asset_type, record.style_preset, record.prompt
    );
}

fn print_settings(settings: &Settings) {
    println!("apiToken:         {}", mask_token(&settings.api_token));
    println!("defaultStyle:     {}", settings.default_style);
    println!("defaultAssetType: {}", settings.default_asset_type);
    println!("autoSave:         {}", settings.auto_save);
    println!("darkMode:         {}", settings.dark_mode);
    println!("quality:          {}", settings.quality);
}

fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "(not set)".to_string();
    }
    let tail: String = token
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{tail}")
}
