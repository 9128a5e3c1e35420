use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{CacheSettings, RepertoireCacheEntry, Stored, StudyCacheEntry};
use crate::error::CacheError;
use crate::store::write_bytes_atomic;

pub const CACHE_SETTINGS_RECORD: &str = "adc_cache";
pub const STUDY_CACHE_RECORD: &str = "adc_cache_study";
pub const REPERTOIRE_CACHE_RECORD: &str = "adc_cache_repertoire";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub uuid: String,
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub association_ids: Vec<String>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub username: String,
    pub read: bool,
    pub write: bool,
}

/// Exact-match predicate on the record name, dotted `value.*` paths and
/// optionally one association id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub name: String,
    pub fields: Vec<(String, Value)>,
    pub association_id: Option<String>,
}

impl MetadataFilter {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn field(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.fields.push((path.to_string(), value.into()));
        self
    }

    pub fn associated_with(mut self, id: &str) -> Self {
        self.association_id = Some(id.to_string());
        self
    }

    pub fn matches(&self, record: &MetadataRecord) -> bool {
        if record.name != self.name {
            return false;
        }
        if let Some(id) = &self.association_id
            && !record.association_ids.iter().any(|assoc| assoc == id)
        {
            return false;
        }
        self.fields.iter().all(|(path, expected)| {
            let pointer = format!("/{}", path.replace('.', "/"));
            record.value.pointer(&pointer) == Some(expected)
        })
    }
}

pub trait MetadataStore: Send + Sync {
    fn create(
        &self,
        name: &str,
        value: Value,
        association_ids: &[String],
    ) -> Result<MetadataRecord, CacheError>;
    fn get(&self, uuid: &str) -> Result<Option<MetadataRecord>, CacheError>;
    fn query(&self, filter: &MetadataFilter) -> Result<Vec<MetadataRecord>, CacheError>;
    fn update(&self, uuid: &str, name: &str, value: Value) -> Result<MetadataRecord, CacheError>;
    fn delete(&self, uuid: &str) -> Result<(), CacheError>;
    fn get_permissions(&self, uuid: &str) -> Result<Vec<Permission>, CacheError>;
}

impl<T: MetadataStore + ?Sized> MetadataStore for Arc<T> {
    fn create(
        &self,
        name: &str,
        value: Value,
        association_ids: &[String],
    ) -> Result<MetadataRecord, CacheError> {
        (**self).create(name, value, association_ids)
    }

    fn get(&self, uuid: &str) -> Result<Option<MetadataRecord>, CacheError> {
        (**self).get(uuid)
    }

    fn query(&self, filter: &MetadataFilter) -> Result<Vec<MetadataRecord>, CacheError> {
        (**self).query(filter)
    }

    fn update(&self, uuid: &str, name: &str, value: Value) -> Result<MetadataRecord, CacheError> {
        (**self).update(uuid, name, value)
    }

    fn delete(&self, uuid: &str) -> Result<(), CacheError> {
        (**self).delete(uuid)
    }

    fn get_permissions(&self, uuid: &str) -> Result<Vec<Permission>, CacheError> {
        (**self).get_permissions(uuid)
    }
}

/// Metadata store kept in memory or, when given a path, in a JSON file shared
/// between processes.
///
/// File-backed stores re-read the file on every call. Mutations hold an
/// exclusive lock on `<path>.lock` across read, change and write, so a daemon
/// and one-shot commands can update the same file without losing each other's
/// records.
pub struct JsonFileMetadataStore {
    path: Option<Utf8PathBuf>,
    owner: String,
    records: Mutex<Vec<MetadataRecord>>,
}

impl JsonFileMetadataStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            owner: "adc-cache".to_string(),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn open(path: &Utf8Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| CacheError::MetadataStore(format!("create {parent}: {err}")))?;
        }
        let records = load_records(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            owner: "adc-cache".to_string(),
            records: Mutex::new(records),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<MetadataRecord>>, CacheError> {
        self.records
            .lock()
            .map_err(|_| CacheError::MetadataStore("record lock poisoned".to_string()))
    }

    fn read<T>(&self, view: impl FnOnce(&[MetadataRecord]) -> T) -> Result<T, CacheError> {
        let mut records = self.lock()?;
        if let Some(path) = &self.path {
            *records = load_records(path)?;
        }
        Ok(view(&records))
    }

    fn write<T>(
        &self,
        change: impl FnOnce(&mut Vec<MetadataRecord>) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut records = self.lock()?;
        let Some(path) = &self.path else {
            return change(&mut records);
        };
        let _file_lock = lock_store_file(path)?;
        *records = load_records(path)?;
        let result = change(&mut records)?;
        let content = serde_json::to_vec_pretty(&*records)
            .map_err(|err| CacheError::MetadataStore(err.to_string()))?;
        write_bytes_atomic(path, &content)?;
        Ok(result)
    }
}

fn load_records(path: &Utf8Path) -> Result<Vec<MetadataRecord>, CacheError> {
    let content = match fs::read_to_string(path.as_std_path()) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(CacheError::MetadataStore(format!("read {path}: {err}")));
        }
    };
    serde_json::from_str(&content)
        .map_err(|err| CacheError::MetadataStore(format!("parse {path}: {err}")))
}

/// The returned handle holds the lock until dropped.
fn lock_store_file(path: &Utf8Path) -> Result<File, CacheError> {
    let lock_path = Utf8PathBuf::from(format!("{path}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path.as_std_path())
        .map_err(|err| CacheError::MetadataStore(format!("open {lock_path}: {err}")))?;
    file.lock_exclusive()
        .map_err(|err| CacheError::MetadataStore(format!("lock {lock_path}: {err}")))?;
    Ok(file)
}

impl MetadataStore for JsonFileMetadataStore {
    fn create(
        &self,
        name: &str,
        value: Value,
        association_ids: &[String],
    ) -> Result<MetadataRecord, CacheError> {
        let now = Utc::now();
        let record = MetadataRecord {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            value,
            association_ids: association_ids.to_vec(),
            created: now,
            last_updated: now,
        };
        self.write(|records| {
            records.push(record.clone());
            Ok(record)
        })
    }

    fn get(&self, uuid: &str) -> Result<Option<MetadataRecord>, CacheError> {
        self.read(|records| records.iter().find(|record| record.uuid == uuid).cloned())
    }

    fn query(&self, filter: &MetadataFilter) -> Result<Vec<MetadataRecord>, CacheError> {
        self.read(|records| {
            records
                .iter()
                .filter(|record| filter.matches(record))
                .cloned()
                .collect()
        })
    }

    fn update(&self, uuid: &str, name: &str, value: Value) -> Result<MetadataRecord, CacheError> {
        self.write(|records| {
            let record = records
                .iter_mut()
                .find(|record| record.uuid == uuid)
                .ok_or_else(|| CacheError::EntryNotFound(uuid.to_string()))?;
            record.name = name.to_string();
            record.value = value;
            record.last_updated = Utc::now();
            Ok(record.clone())
        })
    }

    fn delete(&self, uuid: &str) -> Result<(), CacheError> {
        self.write(|records| {
            let before = records.len();
            records.retain(|record| record.uuid != uuid);
            if records.len() == before {
                return Err(CacheError::EntryNotFound(uuid.to_string()));
            }
            Ok(())
        })
    }

    fn get_permissions(&self, uuid: &str) -> Result<Vec<Permission>, CacheError> {
        let exists = self.read(|records| records.iter().any(|record| record.uuid == uuid))?;
        if !exists {
            return Err(CacheError::EntryNotFound(uuid.to_string()));
        }
        Ok(vec![Permission {
            username: self.owner.clone(),
            read: true,
            write: true,
        }])
    }
}

/// Selection for study and repertoire cache entries; unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    repository_id: Option<String>,
    study_id: Option<String>,
    repertoire_id: Option<String>,
    should_cache: Option<bool>,
    is_cached: Option<bool>,
}

impl EntryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn study(repository_id: &str, study_id: &str) -> Self {
        Self {
            repository_id: Some(repository_id.to_string()),
            study_id: Some(study_id.to_string()),
            ..Self::default()
        }
    }

    pub fn repository(mut self, repository_id: &str) -> Self {
        self.repository_id = Some(repository_id.to_string());
        self
    }

    pub fn repertoire(mut self, repertoire_id: &str) -> Self {
        self.repertoire_id = Some(repertoire_id.to_string());
        self
    }

    pub fn should_cache(mut self, value: bool) -> Self {
        self.should_cache = Some(value);
        self
    }

    pub fn is_cached(mut self, value: bool) -> Self {
        self.is_cached = Some(value);
        self
    }

    /// Studies or repertoires still waiting to be cached.
    pub fn pending(self) -> Self {
        self.should_cache(true).is_cached(false)
    }

    fn to_metadata_filter(&self, name: &str) -> MetadataFilter {
        let mut filter = MetadataFilter::named(name);
        if let Some(id) = &self.repository_id {
            filter = filter.field("repository_id", id.as_str());
        }
        if let Some(id) = &self.study_id {
            filter = filter.field("study_id", id.as_str());
        }
        if let Some(id) = &self.repertoire_id {
            filter = filter.field("repertoire_id", id.as_str());
        }
        if let Some(value) = self.should_cache {
            filter = filter.field("should_cache", value);
        }
        if let Some(value) = self.is_cached {
            filter = filter.field("is_cached", value);
        }
        filter
    }
}

/// Typed access to the cache records kept in the metadata store.
#[derive(Clone)]
pub struct CacheRecords<S: MetadataStore> {
    store: S,
}

impl<S: MetadataStore> CacheRecords<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache_settings(&self) -> Result<Option<Stored<CacheSettings>>, CacheError> {
        let mut records = self
            .store
            .query(&MetadataFilter::named(CACHE_SETTINGS_RECORD))?;
        if records.len() > 1 {
            return Err(CacheError::DuplicateEntry(format!(
                "{} {CACHE_SETTINGS_RECORD} records",
                records.len()
            )));
        }
        records.pop().map(decode).transpose()
    }

    pub fn create_cache_settings(
        &self,
        settings: CacheSettings,
    ) -> Result<Stored<CacheSettings>, CacheError> {
        let record = self
            .store
            .create(CACHE_SETTINGS_RECORD, encode(&settings)?, &[])?;
        decode(record)
    }

    pub fn update_cache_settings(&self, settings: &Stored<CacheSettings>) -> Result<(), CacheError> {
        self.store.update(
            &settings.uuid,
            CACHE_SETTINGS_RECORD,
            encode(&settings.value)?,
        )?;
        Ok(())
    }

    pub fn study_entries(
        &self,
        filter: &EntryFilter,
    ) -> Result<Vec<Stored<StudyCacheEntry>>, CacheError> {
        self.store
            .query(&filter.to_metadata_filter(STUDY_CACHE_RECORD))?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// The single entry for a study; more than one is a data error.
    pub fn study_entry(
        &self,
        repository_id: &str,
        study_id: &str,
    ) -> Result<Option<Stored<StudyCacheEntry>>, CacheError> {
        let mut entries = self.study_entries(&EntryFilter::study(repository_id, study_id))?;
        if entries.len() > 1 {
            return Err(CacheError::DuplicateEntry(format!(
                "{} study cache entries for repository {repository_id} study {study_id}",
                entries.len()
            )));
        }
        Ok(entries.pop())
    }

    pub fn study_entry_by_uuid(
        &self,
        uuid: &str,
    ) -> Result<Option<Stored<StudyCacheEntry>>, CacheError> {
        self.typed_record(uuid, STUDY_CACHE_RECORD)
    }

    pub fn create_study_entry(
        &self,
        entry: &StudyCacheEntry,
    ) -> Result<Stored<StudyCacheEntry>, CacheError> {
        let record = self.store.create(STUDY_CACHE_RECORD, encode(entry)?, &[])?;
        decode(record)
    }

    pub fn update_study_entry(&self, entry: &Stored<StudyCacheEntry>) -> Result<(), CacheError> {
        self.store
            .update(&entry.uuid, STUDY_CACHE_RECORD, encode(&entry.value)?)?;
        Ok(())
    }

    pub fn repertoire_entries(
        &self,
        filter: &EntryFilter,
    ) -> Result<Vec<Stored<RepertoireCacheEntry>>, CacheError> {
        self.store
            .query(&filter.to_metadata_filter(REPERTOIRE_CACHE_RECORD))?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub fn repertoire_entry(
        &self,
        uuid: &str,
    ) -> Result<Option<Stored<RepertoireCacheEntry>>, CacheError> {
        self.typed_record(uuid, REPERTOIRE_CACHE_RECORD)
    }

    pub fn create_repertoire_entry(
        &self,
        entry: &RepertoireCacheEntry,
        study_cache_uuid: &str,
    ) -> Result<Stored<RepertoireCacheEntry>, CacheError> {
        let record = self.store.create(
            REPERTOIRE_CACHE_RECORD,
            encode(entry)?,
            &[study_cache_uuid.to_string()],
        )?;
        decode(record)
    }

    pub fn update_repertoire_entry(
        &self,
        entry: &Stored<RepertoireCacheEntry>,
    ) -> Result<(), CacheError> {
        self.store
            .update(&entry.uuid, REPERTOIRE_CACHE_RECORD, encode(&entry.value)?)?;
        Ok(())
    }

    /// Uncached repertoires that are waiting on an async query.
    pub fn pending_async_repertoires(
        &self,
    ) -> Result<Vec<Stored<RepertoireCacheEntry>>, CacheError> {
        Ok(self
            .repertoire_entries(&EntryFilter::all().pending())?
            .into_iter()
            .filter(|entry| entry.value.async_query_id.is_some())
            .collect())
    }

    pub fn record_name(&self, uuid: &str) -> Result<Option<String>, CacheError> {
        Ok(self.store.get(uuid)?.map(|record| record.name))
    }

    pub fn delete_record(&self, uuid: &str) -> Result<(), CacheError> {
        self.store.delete(uuid)
    }

    fn typed_record<T: DeserializeOwned>(
        &self,
        uuid: &str,
        name: &str,
    ) -> Result<Option<Stored<T>>, CacheError> {
        match self.store.get(uuid)? {
            Some(record) if record.name == name => decode(record).map(Some),
            Some(record) => Err(CacheError::RecordDecode {
                uuid: uuid.to_string(),
                message: format!("expected {name} record, found {}", record.name),
            }),
            None => Ok(None),
        }
    }
}

/// Index entries by a key, rejecting duplicate keys as store corruption.
pub fn index_unique<T, F>(
    entries: Vec<Stored<T>>,
    key: F,
) -> Result<HashMap<String, Stored<T>>, CacheError>
where
    F: Fn(&T) -> &str,
{
    let mut index = HashMap::with_capacity(entries.len());
    for entry in entries {
        let id = key(&entry.value).to_string();
        if index.contains_key(&id) {
            return Err(CacheError::DuplicateEntry(id));
        }
        index.insert(id, entry);
    }
    Ok(index)
}

fn encode<T: Serialize>(value: &T) -> Result<Value, CacheError> {
    serde_json::to_value(value).map_err(|err| CacheError::MetadataStore(err.to_string()))
}

fn decode<T: DeserializeOwned>(record: MetadataRecord) -> Result<Stored<T>, CacheError> {
    let value = serde_json::from_value(record.value).map_err(|err| CacheError::RecordDecode {
        uuid: record.uuid.clone(),
        message: err.to_string(),
    })?;
    Ok(Stored {
        uuid: record.uuid,
        value,
    })
}
