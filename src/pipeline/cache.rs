use chrono::Utc;

use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::domain::{RepertoireCacheEntry, Repository, Stored};
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::{FinishRequest, FinishSource, Message};
use crate::records::MetadataStore;

use super::{FinishOutcome, Pipeline, Reconciliation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Entry was already cached, skipped or deleted.
    Skipped,
    AwaitingAsync { query_id: String },
    StillRunning { query_id: String },
    /// A finished async query was found without a completion notification.
    FinishQueued(FinishRequest),
    /// Synchronous download finalized in-process.
    Finished(FinishOutcome),
}

impl CacheOutcome {
    pub fn follow_up(&self) -> Option<Message> {
        match self {
            CacheOutcome::FinishQueued(request) => Some(Message::Finish(request.clone())),
            CacheOutcome::Finished(outcome) => outcome.follow_up(),
            _ => None,
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
    /// Acquire the rearrangements of one repertoire, synchronously or through
    /// the repository's async query API. Never sets `is_cached` itself.
    pub fn process_cache(&self, repertoire_cache_uuid: &str) -> Result<CacheOutcome, CacheError> {
        let Some(mut entry) = self.records.repertoire_entry(repertoire_cache_uuid)? else {
            tracing::warn!(repertoire_cache_uuid, "repertoire cache entry is gone");
            return Ok(CacheOutcome::Skipped);
        };
        if !entry.value.is_pending() {
            return Ok(CacheOutcome::Skipped);
        }

        let span = tracing::info_span!(
            "cache",
            repository_id = %entry.value.repository_id,
            study_id = %entry.value.study_id,
            repertoire_id = %entry.value.repertoire_id
        );
        let _guard = span.enter();

        let study = self
            .records
            .study_entry(&entry.value.repository_id, &entry.value.study_id)?
            .ok_or_else(|| {
                CacheError::EntryNotFound(format!(
                    "study {} of repertoire {}",
                    entry.value.study_id, entry.value.repertoire_id
                ))
            })?;
        let repository = self.repository(&entry.value.repository_id)?;
        self.layout.ensure_study_dir(&study.uuid)?;

        if let Some(query_id) = entry.value.async_query_id.clone() {
            match self.reconcile_async(repository, &entry, &query_id)? {
                Reconciliation::Finish(request) => {
                    tracing::info!(%query_id, "async query finished without notification");
                    return Ok(CacheOutcome::FinishQueued(request));
                }
                Reconciliation::Running => {
                    tracing::info!(%query_id, "async query still running");
                    return Ok(CacheOutcome::StillRunning { query_id });
                }
                Reconciliation::Stale => {
                    self.alerts.notify(&format!(
                        "ADC download cache: async query {query_id} for repertoire {} is stale, resubmitting",
                        entry.value.repertoire_id
                    ));
                }
                Reconciliation::Resubmit => {
                    tracing::warn!(%query_id, "async query failed, resubmitting");
                }
            }
        }

        if repository.uses_async() {
            self.submit_async(repository, &mut entry)
        } else {
            self.download_sync(repository, &entry)
        }
    }

    fn submit_async(
        &self,
        repository: &Repository,
        entry: &mut Stored<RepertoireCacheEntry>,
    ) -> Result<CacheOutcome, CacheError> {
        let notify_base = self.config.notify_base_url.as_deref().ok_or_else(|| {
            CacheError::ConfigParse(format!(
                "notify_base_url is required for async repository {}",
                repository.repository_id
            ))
        })?;
        let notify_url = format!(
            "{}/adc/cache/notify/{}",
            notify_base.trim_end_matches('/'),
            entry.uuid
        );

        let query_id =
            self.client
                .submit_async_query(repository, &entry.value.repertoire_id, &notify_url)?;
        entry.value.async_query_id = Some(query_id.clone());
        entry.value.async_submitted_at = Some(Utc::now());
        self.records.update_repertoire_entry(entry)?;

        tracing::info!(%query_id, "async query submitted");
        Ok(CacheOutcome::AwaitingAsync { query_id })
    }

    fn download_sync(
        &self,
        repository: &Repository,
        entry: &Stored<RepertoireCacheEntry>,
    ) -> Result<CacheOutcome, CacheError> {
        let destination = self.download_path(&entry.uuid)?;
        if let Err(err) = self.client.download_rearrangements(
            repository,
            &entry.value.repertoire_id,
            destination.as_std_path(),
        ) {
            self.discard_download(&destination);
            return Err(err);
        }
        tracing::info!(path = %destination, "rearrangements downloaded");

        let outcome = self.process_finish(&FinishRequest {
            repertoire_cache_uuid: entry.uuid.clone(),
            source: FinishSource::LocalFile {
                final_file: destination,
                delete_file: true,
            },
        })?;
        Ok(CacheOutcome::Finished(outcome))
    }
}
