use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::domain::{AsyncQueryStatus, AsyncState};
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::{FinishRequest, FinishSource, Message};
use crate::records::{MetadataStore, REPERTOIRE_CACHE_RECORD};

use super::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Ignored,
    FinishQueued,
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
    /// Completion callback from a repository's async query API. `notify_id`
    /// is the repertoire cache entry uuid registered when the query was submitted.
    pub fn handle_async_notification(
        &self,
        notify_id: &str,
        status: &AsyncQueryStatus,
    ) -> Result<NotifyOutcome, CacheError> {
        let result = self.accept_notification(notify_id, status);
        if let Err(err) = &result {
            self.report(&format!("async notification {notify_id}"), err);
        }
        result
    }

    fn accept_notification(
        &self,
        notify_id: &str,
        status: &AsyncQueryStatus,
    ) -> Result<NotifyOutcome, CacheError> {
        if status.status != AsyncState::Finished {
            tracing::info!(notify_id, query_id = %status.query_id, status = %status.status, "ignoring notification");
            return Ok(NotifyOutcome::Ignored);
        }

        match self.records.record_name(notify_id)? {
            Some(name) if name == REPERTOIRE_CACHE_RECORD => {}
            _ => return Err(CacheError::UnexpectedNotification(notify_id.to_string())),
        }
        let entry = self
            .records
            .repertoire_entry(notify_id)?
            .ok_or_else(|| CacheError::UnexpectedNotification(notify_id.to_string()))?;
        if !entry.value.is_pending() {
            tracing::info!(notify_id, "repertoire already finalized, ignoring notification");
            return Ok(NotifyOutcome::Ignored);
        }
        if entry.value.async_query_id.as_deref() != Some(status.query_id.as_str()) {
            return Err(CacheError::QueryMismatch {
                expected: entry.value.async_query_id.clone().unwrap_or_default(),
                actual: status.query_id.clone(),
            });
        }
        self.records
            .study_entry(&entry.value.repository_id, &entry.value.study_id)?
            .ok_or_else(|| {
                CacheError::EntryNotFound(format!(
                    "study {} of repertoire {}",
                    entry.value.study_id, entry.value.repertoire_id
                ))
            })?;
        let final_file = status.final_file.clone().ok_or_else(|| {
            CacheError::AdcResponse(format!("query {} finished without final_file", status.query_id))
        })?;

        self.queues.enqueue(Message::Finish(FinishRequest {
            repertoire_cache_uuid: entry.uuid,
            source: FinishSource::AsyncResult {
                query_id: status.query_id.clone(),
                final_file,
            },
        }));
        tracing::info!(notify_id, query_id = %status.query_id, "finish queued from notification");
        Ok(NotifyOutcome::FinishQueued)
    }
}
