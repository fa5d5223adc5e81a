use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::info;

use crate::{
    adapters::{AmazonWebServicesS3Storage, AzureBlobStorage, GoogleCloudStorage, LocalFileSystem, Storage},
    config::{DiskConfig, StorageConfig},
    model::error::{Result, StorageError},
};

/// Builds drivers from configuration on first use and hands out the same
/// instance afterwards.
pub struct StorageManager {
    config: StorageConfig,
    disks: Mutex<HashMap<String, Arc<dyn Storage>>>,
}

impl StorageManager {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            disks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Storage>>> {
        self.disks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registered or configured disk called `name`.
    ///
    /// Two concurrent first calls may both build the driver; the first one
    /// stored wins and both callers get it.
    pub async fn disk(&self, name: &str) -> Result<Arc<dyn Storage>> {
        if let Some(disk) = self.cache().get(name) {
            return Ok(disk.clone());
        }

        let config = self.config.disks.get(name).ok_or_else(|| {
            StorageError::invalid_input(name, format!("disk `{}` is not configured", name))
        })?;
        let built = build(config).await?;

        let disk = self
            .cache()
            .entry(name.to_string())
            .or_insert(built)
            .clone();
        info!(disk = name, driver = disk.driver(), "disk ready");

        Ok(disk)
    }

    pub async fn default_disk(&self) -> Result<Arc<dyn Storage>> {
        self.disk(&self.config.default).await
    }

    /// Makes `disk` available under `name`, replacing whatever was there.
    pub fn register(&self, name: &str, disk: Arc<dyn Storage>) {
        info!(disk = name, driver = disk.driver(), "disk registered");
        self.cache().insert(name.to_string(), disk);
    }
}

async fn build(config: &DiskConfig) -> Result<Arc<dyn Storage>> {
    let disk: Arc<dyn Storage> = match config {
        DiskConfig::Local(c) => Arc::new(LocalFileSystem::new(&c.root)),
        DiskConfig::S3(c) => Arc::new(AmazonWebServicesS3Storage::connect(c).await),
        DiskConfig::Gcs(c) => Arc::new(GoogleCloudStorage::connect(c).await?),
        DiskConfig::Azure(c) => Arc::new(AzureBlobStorage::connect(c)?),
    };

    Ok(disk)
}
