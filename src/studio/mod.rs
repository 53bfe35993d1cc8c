use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use log::{info, warn};

use crate::{
    bundle,
    catalog::StyleCatalog,
    error::{AppError, AppResult},
    inference::{GenerationClient, HttpTransport, InferenceConfig, InferenceTransport},
    models::{
        AssetData, AssetRecord, GenerationRequest, HistoryFilter, PlainBundle, Settings,
        SettingsPatch,
    },
    prompt,
    storage::{Storage, StorageConfig},
    store::{self, AssetStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    InFlight,
}

/// Flips the state back to `Idle` when dropped, on success and error paths alike.
struct InFlightGuard<'a> {
    state: &'a Mutex<GenerationState>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *lock(self.state) = GenerationState::Idle;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Studio<T = HttpTransport> {
    store: Mutex<AssetStore>,
    catalog: StyleCatalog,
    client: GenerationClient<T>,
    state: Mutex<GenerationState>,
    fallback_token: Option<String>,
}

impl Studio<HttpTransport> {
    pub fn open(storage_config: &StorageConfig, inference_config: &InferenceConfig) -> AppResult<Self> {
        let storage = Storage::open(&storage_config.data_dir)?;
        let catalog = StyleCatalog::load(&storage);
        let store = AssetStore::load(storage, storage_config.max_history);
        let client = GenerationClient::new(inference_config)?;

        Ok(Self::with_parts(
            store,
            catalog,
            client,
            inference_config.api_token.clone(),
        ))
    }
}

impl<T: InferenceTransport> Studio<T> {
    pub fn with_parts(
        store: AssetStore,
        catalog: StyleCatalog,
        client: GenerationClient<T>,
        fallback_token: Option<String>,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            catalog,
            client,
            state: Mutex::new(GenerationState::Idle),
            fallback_token,
        }
    }

    pub fn catalog(&self) -> &StyleCatalog {
        &self.catalog
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub fn generation_state(&self) -> GenerationState {
        *lock(&self.state)
    }

    fn store(&self) -> MutexGuard<'_, AssetStore> {
        lock(&self.store)
    }

    fn begin_generation(&self) -> Option<InFlightGuard<'_>> {
        let mut state = lock(&self.state);
        if *state == GenerationState::InFlight {
            return None;
        }
        *state = GenerationState::InFlight;
        Some(InFlightGuard { state: &self.state })
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&[AssetRecord]) + Send + Sync + 'static,
    {
        self.store().subscribe(listener);
    }

    pub fn records(&self) -> Vec<AssetRecord> {
        self.store().records().to_vec()
    }

    pub fn filter(&self, filter: HistoryFilter) -> Vec<AssetRecord> {
        self.store().filter(filter).into_iter().cloned().collect()
    }

    pub fn settings(&self) -> Settings {
        self.store().settings().clone()
    }

    pub fn update_settings(&self, patch: SettingsPatch) -> AppResult<Settings> {
        if let Some(style) = patch.default_style.as_deref() {
            if !self.catalog.contains(style) {
                return Err(AppError::UnknownStyle(style.to_string()));
            }
        }
        self.store().update_settings(patch).cloned()
    }

    /// Explicit token first, then the stored one, then the environment fallback.
    pub fn resolve_token(&self, explicit: Option<&str>) -> String {
        explicit
            .filter(|token| !token.trim().is_empty())
            .map(str::to_string)
            .or_else(|| {
                Some(self.store().settings().api_token.clone())
                    .filter(|token| !token.trim().is_empty())
            })
            .or_else(|| self.fallback_token.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, index: usize) -> AppResult<AssetRecord> {
        self.store().remove(index)
    }

    pub fn clear(&self) -> AppResult<()> {
        self.store().clear()
    }

    pub fn reuse(&self, index: usize) -> AppResult<GenerationRequest> {
        self.store().get(index).map(AssetRecord::to_request)
    }

    pub fn export_plain(&self) -> PlainBundle {
        self.store().export_plain()
    }

    pub fn import_plain(&self, contents: &str) -> AppResult<usize> {
        let bundle = store::parse_plain_bundle(contents)?;
        self.store().import_plain(bundle)
    }

    pub fn export_packaged(&self, filter: HistoryFilter, asset_folder: &str) -> AppResult<Vec<u8>> {
        let records = self.filter(filter);
        bundle::export_packaged(&records, asset_folder, self.model(), &self.catalog)
    }

    pub fn import_packaged(&self, bytes: &[u8]) -> AppResult<usize> {
        let package = bundle::read_packaged(bytes)?;
        let mut store = self.store();
        bundle::import_packaged(&mut store, &self.catalog, package)
    }

    /// Runs one generation and records the result. Returns `Ok(None)` without doing
    /// anything when another generation is still in flight.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        token: &str,
    ) -> AppResult<Option<AssetRecord>> {
        let Some(_guard) = self.begin_generation() else {
            info!("generation already in progress; ignoring request");
            return Ok(None);
        };

        let (enhanced, bytes) = self.run_generation(request, token).await?;
        let storage = self.store().storage().clone();
        let image_url = storage.store_image(&bytes)?;

        let mut store = self.store();
        let record = match store.insert(AssetData {
            prompt: request.prompt.clone(),
            asset_type: request.asset_type,
            style_preset: request.style_preset.clone(),
            image_url: image_url.clone(),
            timestamp: None,
            name: None,
        }) {
            Ok(record) => record,
            Err(error) => {
                let _ = storage.release_image(&image_url);
                return Err(error);
            }
        };

        if store.settings().auto_save && store.settings().api_token != token {
            let patch = SettingsPatch {
                api_token: Some(token.to_string()),
                ..SettingsPatch::default()
            };
            if let Err(error) = store.update_settings(patch) {
                warn!("failed to remember api token: {error}");
            }
        }

        info!("generated {} from \"{enhanced}\"", record.name);
        Ok(Some(record))
    }

    /// Editor command: generate and write the `.png`/`.json` pair into `output_dir`
    /// without touching the history.
    pub async fn generate_to_directory(
        &self,
        request: &GenerationRequest,
        token: &str,
        output_dir: &Path,
    ) -> AppResult<Option<(PathBuf, PathBuf)>> {
        let Some(_guard) = self.begin_generation() else {
            info!("generation already in progress; ignoring request");
            return Ok(None);
        };

        let (enhanced, bytes) = self.run_generation(request, token).await?;
        let written = bundle::write_asset_pair(
            output_dir,
            request,
            &enhanced,
            self.model(),
            &bytes,
            store::now_millis(),
        )?;

        info!("wrote {}", written.0.display());
        Ok(Some(written))
    }

    async fn run_generation(
        &self,
        request: &GenerationRequest,
        token: &str,
    ) -> AppResult<(String, Vec<u8>)> {
        prompt::validate_inputs(&request.prompt, token)?;
        let enhanced = prompt::enhance(
            &self.catalog,
            &request.prompt,
            request.asset_type,
            &request.style_preset,
        )?;
        let bytes = self.client.generate(&enhanced, token).await?;
        Ok((enhanced, bytes))
    }
}
