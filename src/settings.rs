use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::domain::{CacheSettings, Stored};
use crate::error::CacheError;
use crate::records::{CacheRecords, MetadataStore};

/// Cached view of the singleton `adc_cache` record. Writers go through
/// [`SettingsService::set_enabled`]; other processes' writes become visible
/// after `max_age` or an explicit [`SettingsService::invalidate`].
pub struct SettingsService<S: MetadataStore> {
    records: CacheRecords<S>,
    max_age: Duration,
    cached: Mutex<Option<(Instant, Stored<CacheSettings>)>>,
}

impl<S: MetadataStore> SettingsService<S> {
    pub fn new(records: CacheRecords<S>, max_age: Duration) -> Self {
        Self {
            records,
            max_age,
            cached: Mutex::new(None),
        }
    }

    /// Current settings; a missing record reads as caching disabled.
    pub fn get(&self) -> Result<CacheSettings, CacheError> {
        if let Some(settings) = self.fresh() {
            return Ok(settings);
        }
        match self.records.cache_settings()? {
            Some(stored) => {
                let settings = stored.value;
                self.remember(stored);
                Ok(settings)
            }
            None => Ok(CacheSettings::default()),
        }
    }

    /// Create the singleton record if absent and set its `enable_cache` flag.
    pub fn set_enabled(&self, enable: bool) -> Result<CacheSettings, CacheError> {
        self.invalidate();
        let mut stored = match self.records.cache_settings()? {
            Some(stored) => stored,
            None => {
                tracing::info!("creating cache configuration record");
                self.records.create_cache_settings(CacheSettings::default())?
            }
        };
        stored.value.enable_cache = enable;
        self.records.update_cache_settings(&stored)?;
        let settings = stored.value;
        self.remember(stored);
        Ok(settings)
    }

    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }

    fn fresh(&self) -> Option<CacheSettings> {
        let cached = self.cached.lock().ok()?;
        cached
            .as_ref()
            .filter(|(loaded_at, _)| loaded_at.elapsed() < self.max_age)
            .map(|(_, stored)| stored.value)
    }

    fn remember(&self, stored: Stored<CacheSettings>) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some((Instant::now(), stored));
        }
    }
}
