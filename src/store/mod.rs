use std::collections::HashSet;

use chrono::Utc;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;

use crate::{
    error::{AppError, AppResult},
    models::{
        AssetData, AssetRecord, HistoryFilter, PlainBundle, PlainBundleImport, Settings,
        SettingsPatch,
    },
    storage::{self, Storage},
};

pub const BUNDLE_VERSION: &str = "1.1.0";

pub type ChangeListener = Box<dyn Fn(&[AssetRecord]) + Send + Sync>;

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct AssetStore {
    storage: Storage,
    records: Vec<AssetRecord>,
    settings: Settings,
    max_history: usize,
    listeners: Vec<ChangeListener>,
    recovered: Vec<String>,
}

impl AssetStore {
    /// Reads history and settings. Missing or unreadable records fall back to an
    /// empty history and default settings.
    pub fn load(storage: Storage, max_history: usize) -> Self {
        let max_history = max_history.max(1);
        let mut recovered = Vec::new();

        let records: Vec<AssetRecord> =
            read_or_default(&storage, storage::HISTORY_KEY, &mut recovered);
        let settings: Settings = read_or_default(&storage, storage::SETTINGS_KEY, &mut recovered);

        let mut store = Self {
            storage,
            records,
            settings,
            max_history,
            listeners: Vec::new(),
            recovered,
        };

        if store.records.len() > max_history {
            let mut kept = store.records.clone();
            kept.truncate(max_history);
            if let Err(error) = store.commit_records(kept.clone(), &[]) {
                warn!("failed to persist trimmed history: {error}");
                store.records = kept;
            }
        }

        debug!(
            "loaded {} records from {}",
            store.records.len(),
            store.storage.root().display()
        );
        store
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn records(&self) -> &[AssetRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Keys of persisted records that were found corrupt on load.
    pub fn recovered_keys(&self) -> &[String] {
        &self.recovered
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&[AssetRecord]) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn get(&self, index: usize) -> AppResult<&AssetRecord> {
        self.records.get(index).ok_or(AppError::Index {
            index,
            len: self.records.len(),
        })
    }

    pub fn insert(&mut self, candidate: AssetData) -> AppResult<AssetRecord> {
        let mut inserted = self.insert_many(vec![candidate])?;
        inserted
            .pop()
            .ok_or_else(|| AppError::msg("insert produced no record"))
    }

    /// Inserts each candidate in order (so the last one ends up first) and persists
    /// once. Returns the stored records in insertion order.
    pub fn insert_many(&mut self, candidates: Vec<AssetData>) -> AppResult<Vec<AssetRecord>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let inserted: Vec<AssetRecord> = candidates.into_iter().map(finalize).collect();

        let mut next = Vec::with_capacity(self.records.len() + inserted.len());
        next.extend(inserted.iter().rev().cloned());
        next.extend(self.records.iter().cloned());
        next.truncate(self.max_history);

        // Candidates cut by the truncate may already own managed images.
        self.commit_records(next, &inserted)?;
        Ok(inserted)
    }

    pub fn remove(&mut self, index: usize) -> AppResult<AssetRecord> {
        let removed = self.get(index)?.clone();
        let mut next = self.records.clone();
        next.remove(index);

        self.commit_records(next, &[])?;
        Ok(removed)
    }

    /// Unconditional; confirming with the user is the caller's job.
    pub fn clear(&mut self) -> AppResult<()> {
        self.storage.remove_record(storage::HISTORY_KEY)?;
        let previous = std::mem::take(&mut self.records);
        self.release_unreferenced(&previous);
        self.notify();
        info!("cleared {} records", previous.len());
        Ok(())
    }

    pub fn filter(&self, filter: HistoryFilter) -> Vec<&AssetRecord> {
        self.records
            .iter()
            .filter(|record| filter.matches(record))
            .collect()
    }

    pub fn update_settings(&mut self, patch: SettingsPatch) -> AppResult<&Settings> {
        let mut next = self.settings.clone();
        next.apply(patch);
        self.storage.write_record(storage::SETTINGS_KEY, &next)?;
        self.settings = next;
        Ok(&self.settings)
    }

    pub fn export_plain(&self) -> PlainBundle {
        PlainBundle {
            version: BUNDLE_VERSION.to_string(),
            timestamp: now_millis(),
            history: self.records.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Puts the imported records ahead of the current ones, keeping file order, and
    /// shallow-merges settings. Nothing changes unless both records persist.
    pub fn import_plain(&mut self, bundle: PlainBundleImport) -> AppResult<usize> {
        if bundle.version.as_deref().map_or(true, |v| v.trim().is_empty()) {
            return Err(AppError::format("missing version"));
        }
        let history = bundle
            .history
            .ok_or_else(|| AppError::format("missing history"))?;

        let imported = history.len();
        let incoming: Vec<AssetRecord> = history
            .into_iter()
            .map(|record| finalize(record.into()))
            .collect();
        let mut next = incoming.clone();
        next.extend(self.records.iter().cloned());
        next.truncate(self.max_history);

        let settings_patch = bundle.settings.filter(|patch| !patch.is_empty());
        let next_settings = settings_patch.map(|patch| {
            let mut merged = self.settings.clone();
            merged.apply(patch);
            merged
        });

        self.storage.write_record(storage::HISTORY_KEY, &next)?;
        if let Some(settings) = &next_settings {
            if let Err(error) = self.storage.write_record(storage::SETTINGS_KEY, settings) {
                self.restore_persisted_history();
                return Err(error);
            }
        }

        let previous = std::mem::replace(&mut self.records, next);
        if let Some(settings) = next_settings {
            self.settings = settings;
        }
        self.release_unreferenced(previous.iter().chain(&incoming));
        self.notify();

        info!("imported {imported} records");
        Ok(imported)
    }

    /// `incoming` are records offered in this mutation that may not have survived
    /// the capacity limit.
    fn commit_records(
        &mut self,
        next: Vec<AssetRecord>,
        incoming: &[AssetRecord],
    ) -> AppResult<()> {
        self.storage.write_record(storage::HISTORY_KEY, &next)?;

        let previous = std::mem::replace(&mut self.records, next);
        self.release_unreferenced(previous.iter().chain(incoming));
        self.notify();
        Ok(())
    }

    fn restore_persisted_history(&self) {
        let result = if self.records.is_empty() {
            self.storage.remove_record(storage::HISTORY_KEY)
        } else {
            self.storage
                .write_record(storage::HISTORY_KEY, &self.records)
        };
        if let Err(error) = result {
            warn!("failed to restore history after aborted import: {error}");
        }
    }

    /// Deletes managed image files that no kept record points at any more.
    fn release_unreferenced<'a>(&self, superseded: impl IntoIterator<Item = &'a AssetRecord>) {
        let kept: HashSet<&str> = self
            .records
            .iter()
            .map(|record| record.image_url.as_str())
            .collect();

        let mut dropped = 0;
        for record in superseded {
            if kept.contains(record.image_url.as_str()) {
                continue;
            }
            dropped += 1;
            if let Err(error) = self.storage.release_image(&record.image_url) {
                warn!("failed to release image for {}: {error}", record.name);
            }
        }

        if dropped > 0 {
            debug!("released {dropped} image references");
        }
    }

    fn notify(&self) {
        for listener in &self.listeners {
            listener(&self.records);
        }
    }
}

fn finalize(candidate: AssetData) -> AssetRecord {
    let timestamp = candidate.timestamp.unwrap_or_else(now_millis);
    let name = candidate
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| AssetRecord::derive_name(candidate.asset_type, timestamp));

    AssetRecord {
        prompt: candidate.prompt,
        asset_type: candidate.asset_type,
        style_preset: candidate.style_preset,
        image_url: candidate.image_url,
        timestamp,
        name,
    }
}

fn read_or_default<T: DeserializeOwned + Default>(
    storage: &Storage,
    key: &str,
    recovered: &mut Vec<String>,
) -> T {
    match storage.read_record::<T>(key) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(error @ AppError::StorageCorruption { .. }) => {
            warn!("{error}; starting from defaults");
            recovered.push(key.to_string());
            T::default()
        }
        Err(error) => {
            warn!("failed to read {key}: {error}; starting from defaults");
            T::default()
        }
    }
}

/// Parses a plain export document. Unparsable input is a format problem.
pub fn parse_plain_bundle(contents: &str) -> AppResult<PlainBundleImport> {
    serde_json::from_str(contents).map_err(|error| AppError::format(error.to_string()))
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use tempfile::TempDir;

    use super::*;
    use crate::models::AssetType;

    fn open_store(dir: &Path, max: usize) -> AssetStore {
        AssetStore::load(Storage::open(dir).unwrap(), max)
    }

    fn candidate(asset_type: AssetType, prompt: &str) -> AssetData {
        AssetData {
            prompt: prompt.to_string(),
            asset_type,
            style_preset: "pixel".to_string(),
            image_url: format!("data:image/png;base64,{prompt}"),
            timestamp: None,
            name: None,
        }
    }

    fn read_history(dir: &Path) -> Option<String> {
        fs::read_to_string(dir.join("history.json")).ok()
    }

    #[test]
    fn fresh_store_is_empty_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(temp_dir.path(), 50);
        assert!(store.is_empty());
        assert_eq!(store.settings(), &Settings::default());
        assert!(store.recovered_keys().is_empty());
    }

    #[test]
    fn insert_names_and_prepends() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);

        let first = store.insert(candidate(AssetType::Item, "first")).unwrap();
        let second = store.insert(candidate(AssetType::Weapon, "second")).unwrap();

        assert_eq!(first.name, format!("item-{}.png", first.timestamp));
        assert_eq!(store.records()[0], second);
        assert_eq!(store.records()[1], first);
    }

    #[test]
    fn insert_keeps_existing_name_and_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);

        let mut data = candidate(AssetType::Prop, "crate");
        data.timestamp = Some(1_700_000_000_000);
        data.name = Some("custom.png".to_string());
        let record = store.insert(data).unwrap();

        assert_eq!(record.timestamp, 1_700_000_000_000);
        assert_eq!(record.name, "custom.png");
    }

    #[test]
    fn capacity_evicts_the_oldest() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 3);

        for i in 0..5 {
            store
                .insert(candidate(AssetType::Item, &format!("p{i}")))
                .unwrap();
            assert!(store.len() <= 3);
        }

        let prompts: Vec<_> = store.records().iter().map(|r| r.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["p4", "p3", "p2"]);
    }

    #[test]
    fn eviction_releases_managed_images() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 1);

        let path = store.storage().store_image(&storage::tiny_png()).unwrap();
        let mut data = candidate(AssetType::Item, "old");
        data.image_url = path.clone();
        store.insert(data).unwrap();
        assert!(Path::new(&path).exists());

        store.insert(candidate(AssetType::Item, "new")).unwrap();
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn candidates_cut_by_capacity_release_their_images() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 1);

        let older = store.storage().store_image(&storage::tiny_png()).unwrap();
        let newer = store.storage().store_image(&storage::tiny_png()).unwrap();
        let mut first = candidate(AssetType::Item, "older");
        first.image_url = older.clone();
        let mut second = candidate(AssetType::Item, "newer");
        second.image_url = newer.clone();

        store.insert_many(vec![first, second]).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].image_url, newer);
        assert!(Path::new(&newer).exists());
        assert!(!Path::new(&older).exists());
        let managed = fs::read_dir(store.storage().images_dir()).unwrap().count();
        assert_eq!(managed, 1);
    }

    #[test]
    fn removing_an_imported_record_never_deletes_outside_images() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        store
            .update_settings(SettingsPatch {
                quality: Some("draft".to_string()),
                ..SettingsPatch::default()
            })
            .unwrap();
        let settings_path = temp_dir.path().join("settings.json");
        let escaping = store.storage().images_dir().join("..").join("settings.json");

        let document = serde_json::json!({
            "version": "1.1.0",
            "history": [{
                "prompt": "x",
                "assetType": "prop",
                "stylePreset": "pixel",
                "imageUrl": escaping.to_string_lossy(),
                "timestamp": 1
            }]
        });
        store
            .import_plain(parse_plain_bundle(&document.to_string()).unwrap())
            .unwrap();

        store.remove(0).unwrap();
        assert!(settings_path.exists());
        assert_eq!(open_store(temp_dir.path(), 50).settings().quality, "draft");
    }

    #[test]
    fn persisted_state_matches_memory() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        store.insert(candidate(AssetType::Vehicle, "bike")).unwrap();
        store.insert(candidate(AssetType::Building, "tower")).unwrap();
        store.remove(0).unwrap();

        let reloaded = open_store(temp_dir.path(), 50);
        assert_eq!(reloaded.records(), store.records());
        assert_eq!(reloaded.records()[0].prompt, "bike");
    }

    #[test]
    fn remove_twice_shifts_then_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        store.insert(candidate(AssetType::Item, "a")).unwrap();
        store.insert(candidate(AssetType::Item, "b")).unwrap();

        let removed = store.remove(1).unwrap();
        assert_eq!(removed.prompt, "a");

        let before = read_history(temp_dir.path());
        let result = store.remove(1);
        assert!(matches!(result, Err(AppError::Index { index: 1, len: 1 })));
        assert_eq!(store.len(), 1);
        assert_eq!(read_history(temp_dir.path()), before);
    }

    #[test]
    fn remove_at_same_index_takes_the_next_element() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        for prompt in ["a", "b", "c"] {
            store.insert(candidate(AssetType::Item, prompt)).unwrap();
        }

        assert_eq!(store.remove(0).unwrap().prompt, "c");
        assert_eq!(store.remove(0).unwrap().prompt, "b");
    }

    #[test]
    fn clear_removes_the_persisted_record() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        store.insert(candidate(AssetType::Item, "a")).unwrap();

        store.clear().unwrap();
        assert!(store.is_empty());
        assert!(read_history(temp_dir.path()).is_none());
        assert!(open_store(temp_dir.path(), 50).is_empty());
    }

    #[test]
    fn filter_all_is_identity_and_typed_filter_keeps_order() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        for (kind, prompt) in [
            (AssetType::Weapon, "sword"),
            (AssetType::Item, "potion"),
            (AssetType::Weapon, "bow"),
        ] {
            store.insert(candidate(kind, prompt)).unwrap();
        }

        let all: Vec<_> = store.filter(HistoryFilter::All).into_iter().cloned().collect();
        assert_eq!(all, store.records());

        let weapons: Vec<_> = store
            .filter(HistoryFilter::Only(AssetType::Weapon))
            .iter()
            .map(|r| r.prompt.as_str())
            .collect();
        assert_eq!(weapons, vec!["bow", "sword"]);
    }

    #[test]
    fn listeners_see_every_mutation() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = refreshes.clone();
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.insert(candidate(AssetType::Item, "a")).unwrap();
        store.remove(0).unwrap();
        store.clear().unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn corrupt_history_is_recovered_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        Storage::open(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("history.json"), "{oops").unwrap();

        let store = open_store(temp_dir.path(), 50);
        assert!(store.is_empty());
        assert_eq!(store.recovered_keys(), ["history".to_string()]);
    }

    #[test]
    fn oversized_history_is_trimmed_on_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 10);
        for i in 0..6 {
            store
                .insert(candidate(AssetType::Item, &format!("p{i}")))
                .unwrap();
        }

        let reloaded = open_store(temp_dir.path(), 4);
        assert_eq!(reloaded.len(), 4);
        assert_eq!(open_store(temp_dir.path(), 10).len(), 4);
    }

    #[test]
    fn plain_roundtrip_into_empty_store() {
        let source_dir = TempDir::new().unwrap();
        let mut source = open_store(source_dir.path(), 50);
        source.insert(candidate(AssetType::Creature, "wolf")).unwrap();
        source.insert(candidate(AssetType::Prop, "barrel")).unwrap();
        source
            .update_settings(SettingsPatch {
                default_style: Some("anime".to_string()),
                dark_mode: Some(false),
                ..SettingsPatch::default()
            })
            .unwrap();

        let exported = serde_json::to_string_pretty(&source.export_plain()).unwrap();

        let target_dir = TempDir::new().unwrap();
        let mut target = open_store(target_dir.path(), 50);
        let count = target
            .import_plain(parse_plain_bundle(&exported).unwrap())
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(target.records(), source.records());
        assert_eq!(target.settings(), source.settings());
    }

    #[test]
    fn import_prepends_in_file_order() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        store.insert(candidate(AssetType::Item, "existing")).unwrap();

        let bundle = parse_plain_bundle(
            r#"{
                "version": "1.1.0",
                "history": [
                    {"prompt": "x", "assetType": "prop", "stylePreset": "pixel", "imageUrl": "data:,", "timestamp": 1},
                    {"prompt": "y", "assetType": "prop", "stylePreset": "pixel", "imageUrl": "data:,", "timestamp": 2}
                ],
                "settings": {"quality": "draft"}
            }"#,
        )
        .unwrap();
        store.import_plain(bundle).unwrap();

        let prompts: Vec<_> = store.records().iter().map(|r| r.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["x", "y", "existing"]);
        assert_eq!(store.records()[0].name, "prop-1.png");
        assert_eq!(store.settings().quality, "draft");
        assert_eq!(store.settings().default_style, "realistic");
    }

    #[test]
    fn import_without_required_fields_changes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        store.insert(candidate(AssetType::Item, "keep")).unwrap();
        let history_before = read_history(temp_dir.path());
        let settings_before = store.settings().clone();

        let result = store.import_plain(parse_plain_bundle("{}").unwrap());
        assert!(matches!(result, Err(AppError::Format(_))));

        let result = store.import_plain(parse_plain_bundle(r#"{"version":"1.1.0"}"#).unwrap());
        assert!(matches!(result, Err(AppError::Format(_))));

        assert_eq!(read_history(temp_dir.path()), history_before);
        assert_eq!(store.settings(), &settings_before);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unparsable_bundle_is_a_format_error() {
        assert!(matches!(
            parse_plain_bundle("not json"),
            Err(AppError::Format(_))
        ));
    }

    #[test]
    fn update_settings_persists() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = open_store(temp_dir.path(), 50);
        store
            .update_settings(SettingsPatch {
                api_token: Some("hf_saved".to_string()),
                ..SettingsPatch::default()
            })
            .unwrap();

        assert_eq!(open_store(temp_dir.path(), 50).settings().api_token, "hf_saved");
    }
}
