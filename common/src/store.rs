use std::{
    fs,
    io::{ErrorKind, Write},
    path::PathBuf,
};

use log::{debug, info, warn};

use crate::{
    config::{ConfigPatch, Configuration},
    error::StorageError,
};

/// Raw byte storage for the persisted configuration record.
pub trait ConfigBackend {
    /// `Ok(None)` when no record has been written yet.
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Must either replace the record completely or leave the previous one
    /// intact.
    fn write(&mut self, payload: &[u8]) -> Result<(), StorageError>;
}

/// JSON file written through a sibling temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "config.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigBackend for FileBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, payload: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

/// In-memory record, used when no persistent medium is available.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    record: Option<Vec<u8>>,
}

impl MemoryBackend {
    pub fn with_record(record: impl Into<Vec<u8>>) -> Self {
        Self {
            record: Some(record.into()),
        }
    }

    pub fn record(&self) -> Option<&[u8]> {
        self.record.as_deref()
    }
}

impl ConfigBackend for MemoryBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.record.clone())
    }

    fn write(&mut self, payload: &[u8]) -> Result<(), StorageError> {
        self.record = Some(payload.to_vec());
        Ok(())
    }
}

/// Sole owner of the live [`Configuration`]. The in-memory copy stays
/// authoritative for the session even when persisting it fails.
#[derive(Debug)]
pub struct ConfigStore<B: ConfigBackend> {
    backend: B,
    config: Configuration,
    storage_healthy: bool,
}

impl<B: ConfigBackend> ConfigStore<B> {
    /// Loads the persisted record. Missing or unreadable records fall back to
    /// defaults, which are written back straight away.
    pub fn load(backend: B) -> Self {
        let mut store = Self {
            backend,
            config: Configuration::default(),
            storage_healthy: true,
        };

        let loaded = match store.backend.read() {
            Ok(Some(raw)) => match serde_json::from_slice::<Configuration>(&raw) {
                Ok(mut config) => {
                    config.sanitize();
                    Some(config)
                }
                Err(err) => {
                    warn!("stored config is corrupt ({err}); restoring defaults");
                    None
                }
            },
            Ok(None) => {
                info!("no stored config; writing defaults");
                None
            }
            Err(err) => {
                // The record may still be intact; leave it alone and run from
                // defaults until a later update writes successfully.
                warn!("failed to read stored config ({err}); running from defaults");
                store.storage_healthy = false;
                return store;
            }
        };

        match loaded {
            Some(config) => {
                store.config = config;
                info!(
                    "config loaded: dry={} wet={} threshold={}%",
                    config.dry_reading, config.wet_reading, config.dry_threshold_percent
                );
            }
            None => {
                let defaults = store.config;
                if let Err(err) = store.save(&defaults) {
                    warn!("failed to persist default config: {err}");
                }
            }
        }

        store
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn storage_healthy(&self) -> bool {
        self.storage_healthy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Adopts `config` and persists it.
    pub fn save(&mut self, config: &Configuration) -> Result<(), StorageError> {
        let mut config = *config;
        config.sanitize();
        self.config = config;

        let result = serde_json::to_vec(&config)
            .map_err(StorageError::from)
            .and_then(|payload| self.backend.write(&payload));
        self.storage_healthy = result.is_ok();
        result
    }

    /// Merges the present fields of `patch` and persists the result. On a
    /// storage error the merged configuration is still in effect.
    pub fn update(&mut self, patch: &ConfigPatch) -> Result<Configuration, StorageError> {
        if patch.is_empty() {
            debug!("config update carries no fields; re-saving current record");
        }
        let mut merged = self.config;
        merged.merge(patch);
        self.save(&merged)?;
        info!(
            "config updated: dry={} wet={} threshold={}%",
            merged.dry_reading, merged.wet_reading, merged.dry_threshold_percent
        );
        Ok(merged)
    }
}
