use std::time::Duration;

use assert_matches::assert_matches;

use adc_download_cache::config::{ConfigLoader, DEFAULT_CONFIG_FILE};
use adc_download_cache::error::CacheError;

#[test]
fn resolves_config_file_with_overrides() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join(DEFAULT_CONFIG_FILE);
    std::fs::write(
        &path,
        r#"{
            "cache_root": "/srv/adc-cache",
            "metadata_path": "/srv/adc-cache/records.json",
            "postit": { "base_url": "https://tapis.example.org", "token": "secret" },
            "file_base_url": "https://files.example.org/adc-cache",
            "notify_base_url": "https://cache.example.org/api/",
            "alert_webhook": "https://chat.example.org/hooks/adc",
            "schedule": { "trigger_interval_secs": 600, "sweep_interval_secs": 7200 },
            "archive_cap_bytes": 1048576,
            "async_stale_after_secs": 3600,
            "repositories": [
                { "repository_id": "vdjserver", "server_host": "vdjserver.org",
                  "base_url": "/airr/v1", "async_host": "vdjserver.org",
                  "async_base_url": "/airr/async/v1", "supports_async": true,
                  "enable_cache": true },
                { "repository_id": "ireceptor", "server_host": "ipa1.ireceptor.org",
                  "base_url": "/airr/v1" }
            ]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.cache_root.as_str(), "/srv/adc-cache");
    assert_eq!(resolved.metadata_path.as_str(), "/srv/adc-cache/records.json");
    assert_eq!(resolved.postit.token.as_deref(), Some("secret"));
    assert_eq!(
        resolved.pipeline.notify_base_url.as_deref(),
        Some("https://cache.example.org/api")
    );
    assert_eq!(resolved.pipeline.archive_cap_bytes, 1_048_576);
    assert_eq!(resolved.pipeline.async_stale_after, Duration::from_secs(3600));
    assert_eq!(resolved.schedule.trigger_interval, Duration::from_secs(600));
    assert_eq!(resolved.schedule.sweep_interval, Duration::from_secs(7200));
    assert!(resolved.repositories[0].uses_async());
    assert!(!resolved.repositories[1].enable_cache);
}

#[test]
fn malformed_config_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join(DEFAULT_CONFIG_FILE);
    std::fs::write(&path, r#"{ "repositories": [] }"#).unwrap();

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(CacheError::ConfigParse(_))
    );
}

#[test]
fn async_repository_without_notify_url_is_rejected_at_load() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join(DEFAULT_CONFIG_FILE);
    std::fs::write(
        &path,
        r#"{
            "cache_root": "/srv/adc-cache",
            "postit": { "base_url": "https://tapis.example.org" },
            "file_base_url": "https://files.example.org/adc-cache",
            "repositories": [
                { "repository_id": "vdjserver", "server_host": "vdjserver.org",
                  "base_url": "/airr/v1", "async_host": "vdjserver.org",
                  "supports_async": true, "enable_cache": true }
            ]
        }"#,
    )
    .unwrap();

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(CacheError::ConfigParse(message)) if message.contains("vdjserver")
    );
}

#[test]
fn explicit_missing_path_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(CacheError::ConfigRead(_))
    );
}
