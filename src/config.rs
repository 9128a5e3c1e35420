use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::archive::DEFAULT_ARCHIVE_CAP_BYTES;
use crate::domain::Repository;
use crate::error::CacheError;
use crate::store::CacheLayout;

pub const DEFAULT_CONFIG_FILE: &str = "adc-cache.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache_root: Option<String>,
    #[serde(default)]
    pub metadata_path: Option<String>,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    pub postit: PostitConfig,
    /// Base URL of the public file service that serves `cache_root`.
    pub file_base_url: String,
    /// Public URL the async notification callbacks are posted to.
    #[serde(default)]
    pub notify_base_url: Option<String>,
    #[serde(default)]
    pub alert_webhook: Option<String>,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub archive_cap_bytes: Option<u64>,
    #[serde(default)]
    pub async_stale_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostitConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub trigger_interval_secs: Option<u64>,
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub trigger_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            trigger_interval: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Knobs the pipeline stages read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub file_base_url: String,
    pub notify_base_url: Option<String>,
    pub archive_cap_bytes: u64,
    pub async_stale_after: Duration,
}

impl PipelineSettings {
    pub fn new(file_base_url: &str) -> Self {
        Self {
            file_base_url: file_base_url.trim_end_matches('/').to_string(),
            notify_base_url: None,
            archive_cap_bytes: DEFAULT_ARCHIVE_CAP_BYTES,
            async_stale_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub cache_root: Utf8PathBuf,
    pub metadata_path: Utf8PathBuf,
    pub repositories: Vec<Repository>,
    pub postit: PostitConfig,
    pub alert_webhook: Option<String>,
    pub schedule: Schedule,
    pub pipeline: PipelineSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CacheError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(CacheError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CacheError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CacheError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CacheError> {
        let cache_root = match config.cache_root {
            Some(root) => Utf8PathBuf::from(root),
            None => CacheLayout::default_root()?,
        };
        let metadata_path = config
            .metadata_path
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| cache_root.join("metadata.json"));

        let mut seen = std::collections::HashSet::new();
        for repository in &config.repositories {
            if repository.repository_id.trim().is_empty() {
                return Err(CacheError::ConfigParse(
                    "repository_id must not be empty".to_string(),
                ));
            }
            if !seen.insert(repository.repository_id.as_str()) {
                return Err(CacheError::ConfigParse(format!(
                    "duplicate repository_id {}",
                    repository.repository_id
                )));
            }
        }

        let defaults = Schedule::default();
        let schedule_config = config.schedule.unwrap_or_default();
        let schedule = Schedule {
            trigger_interval: schedule_config
                .trigger_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.trigger_interval),
            sweep_interval: schedule_config
                .sweep_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        };

        if config.notify_base_url.is_none()
            && let Some(repository) = config.repositories.iter().find(|repo| repo.uses_async())
        {
            return Err(CacheError::ConfigParse(format!(
                "notify_base_url is required for async repository {}",
                repository.repository_id
            )));
        }

        let mut pipeline = PipelineSettings::new(&config.file_base_url);
        pipeline.notify_base_url = config
            .notify_base_url
            .map(|url| url.trim_end_matches('/').to_string());
        if let Some(cap) = config.archive_cap_bytes {
            pipeline.archive_cap_bytes = cap;
        }
        if let Some(secs) = config.async_stale_after_secs {
            pipeline.async_stale_after = Duration::from_secs(secs);
        }

        Ok(ResolvedConfig {
            cache_root,
            metadata_path,
            repositories: config.repositories,
            postit: config.postit,
            alert_webhook: config.alert_webhook,
            schedule,
            pipeline,
        })
    }
}
