use std::collections::BTreeMap;

use serde::Serialize;

use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::domain::{Artifact, CacheSettings, StudyCacheEntry, Stored};
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::{QueueCounts, QueueName};
use crate::records::{EntryFilter, MetadataStore};

use super::Pipeline;

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub enable_cache: bool,
    pub studies_cached: usize,
    pub studies_pending: usize,
    pub repertoires_cached: usize,
    pub repertoires_pending: usize,
    pub repertoires_awaiting_async: usize,
    pub queues: BTreeMap<&'static str, QueueCounts>,
}

/// A finalized study as listed to operators.
#[derive(Debug, Clone, Serialize)]
pub struct CachedStudy {
    pub study_cache_uuid: String,
    pub repository_id: String,
    pub study_id: String,
    pub archive_file: Vec<String>,
    pub download_url: Vec<String>,
    pub file_size: Vec<Option<u64>>,
}

impl From<Stored<StudyCacheEntry>> for CachedStudy {
    fn from(entry: Stored<StudyCacheEntry>) -> Self {
        let files = entry
            .value
            .artifact
            .as_ref()
            .map(Artifact::files)
            .unwrap_or_default();
        Self {
            study_cache_uuid: entry.uuid.clone(),
            archive_file: files.iter().map(|file| file.archive_file.clone()).collect(),
            download_url: files.iter().map(|file| file.download_url.clone()).collect(),
            file_size: files.iter().map(|file| file.file_size).collect(),
            repository_id: entry.value.repository_id,
            study_id: entry.value.study_id,
        }
    }
}

impl<S, C, P, L, A, R> Pipeline<S, C, P, L, A, R>
where
    S: MetadataStore + Clone,
    C: RepositoryClient,
    P: PublicLinkService,
    L: ProjectLoadStatus,
    A: AlertSink,
    R: Archiver,
{
    pub fn cache_status(&self) -> Result<CacheStatus, CacheError> {
        self.settings.invalidate();
        let settings = self.settings.get()?;
        let studies = self.records.study_entries(&EntryFilter::all())?;
        let repertoires = self.records.repertoire_entries(&EntryFilter::all())?;

        Ok(CacheStatus {
            enable_cache: settings.enable_cache,
            studies_cached: studies.iter().filter(|entry| entry.value.is_cached).count(),
            studies_pending: studies.iter().filter(|entry| entry.value.is_pending()).count(),
            repertoires_cached: repertoires
                .iter()
                .filter(|entry| entry.value.is_cached)
                .count(),
            repertoires_pending: repertoires
                .iter()
                .filter(|entry| entry.value.is_pending())
                .count(),
            repertoires_awaiting_async: repertoires
                .iter()
                .filter(|entry| entry.value.is_pending() && entry.value.async_query_id.is_some())
                .count(),
            queues: QueueName::ALL
                .into_iter()
                .map(|queue| (queue.as_str(), self.queues.counts(queue)))
                .collect(),
        })
    }

    /// Flip the cache on or off; enabling also kicks off a cycle.
    pub fn set_cache_enabled(&self, enable: bool) -> Result<CacheSettings, CacheError> {
        self.enable_and_trigger(enable)
    }

    pub fn trigger_manual_cache(&self) -> Result<CacheSettings, CacheError> {
        self.enable_and_trigger(true)
    }

    pub fn cached_studies(&self) -> Result<Vec<CachedStudy>, CacheError> {
        Ok(self
            .records
            .study_entries(&EntryFilter::all().is_cached(true))?
            .into_iter()
            .map(CachedStudy::from)
            .collect())
    }

    pub fn update_cache_for_study(&self, _repository_id: &str, _study_id: &str) -> Result<(), CacheError> {
        Err(CacheError::NotImplemented("update cache for study"))
    }

    pub fn update_cache_for_repertoire(
        &self,
        _repository_id: &str,
        _repertoire_id: &str,
    ) -> Result<(), CacheError> {
        Err(CacheError::NotImplemented("update cache for repertoire"))
    }

    pub fn delete_cache_for_study(&self, _repository_id: &str, _study_id: &str) -> Result<(), CacheError> {
        Err(CacheError::NotImplemented("delete cache for study"))
    }

    pub fn delete_cache_for_repertoire(
        &self,
        _repository_id: &str,
        _repertoire_id: &str,
    ) -> Result<(), CacheError> {
        Err(CacheError::NotImplemented("delete cache for repertoire"))
    }
}
