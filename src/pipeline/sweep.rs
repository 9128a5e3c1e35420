use chrono::Utc;

use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::domain::{AsyncState, RepertoireCacheEntry, Repository, Stored};
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::{FinishRequest, FinishSource, Message};
use crate::records::MetadataStore;

use super::Pipeline;

/// What to do with a repertoire whose async query has not been finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The query finished but nobody finalized it.
    Finish(FinishRequest),
    /// The query failed; submit a fresh one.
    Resubmit,
    Running,
    /// Still running past the staleness bound.
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub finish: Vec<FinishRequest>,
    pub resubmit: usize,
    pub stale: usize,
    pub running: usize,
    pub failures: usize,
}

impl SweepReport {
    /// Finish jobs for healed queries, then a Trigger to keep the cycle moving.
    pub fn follow_ups(&self) -> Vec<Message> {
        self.finish
            .iter()
            .cloned()
            .map(Message::Finish)
            .chain(std::iter::once(Message::Trigger))
            .collect()
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
    /// Poll the repository for an outstanding async query and decide how to proceed.
    pub fn reconcile_async(
        &self,
        repository: &Repository,
        entry: &Stored<RepertoireCacheEntry>,
        query_id: &str,
    ) -> Result<Reconciliation, CacheError> {
        let status = self.client.poll_async_status(repository, query_id)?;
        tracing::debug!(
            repertoire_id = %entry.value.repertoire_id,
            query_id,
            status = %status.status,
            "async query status"
        );

        match status.status {
            AsyncState::Finished => match status.final_file {
                Some(final_file) => Ok(Reconciliation::Finish(FinishRequest {
                    repertoire_cache_uuid: entry.uuid.clone(),
                    source: FinishSource::AsyncResult {
                        query_id: query_id.to_string(),
                        final_file,
                    },
                })),
                None => {
                    tracing::warn!(query_id, "finished async query has no final_file");
                    Ok(Reconciliation::Resubmit)
                }
            },
            AsyncState::Error => Ok(Reconciliation::Resubmit),
            _ if self.is_stale(&entry.value) => Ok(Reconciliation::Stale),
            _ => Ok(Reconciliation::Running),
        }
    }

    fn is_stale(&self, entry: &RepertoireCacheEntry) -> bool {
        entry.async_submitted_at.is_some_and(|submitted_at| {
            (Utc::now() - submitted_at)
                .to_std()
                .is_ok_and(|elapsed| elapsed > self.config.async_stale_after)
        })
    }

    /// Scheduled reconciliation over every repertoire waiting on an async query.
    pub fn process_sweep(&self) -> Result<SweepReport, CacheError> {
        let mut report = SweepReport::default();
        for mut entry in self.records.pending_async_repertoires()? {
            report.examined += 1;
            if let Err(err) = self.sweep_entry(&mut entry, &mut report) {
                report.failures += 1;
                self.report_non_fatal(
                    &format!("sweep repertoire {}", entry.value.repertoire_id),
                    &err,
                );
            }
        }
        tracing::info!(
            examined = report.examined,
            finish = report.finish.len(),
            resubmit = report.resubmit,
            stale = report.stale,
            running = report.running,
            failures = report.failures,
            "async sweep complete"
        );
        Ok(report)
    }

    fn sweep_entry(
        &self,
        entry: &mut Stored<RepertoireCacheEntry>,
        report: &mut SweepReport,
    ) -> Result<(), CacheError> {
        let Some(query_id) = entry.value.async_query_id.clone() else {
            return Ok(());
        };
        let repository = self.repository(&entry.value.repository_id)?;

        match self.reconcile_async(repository, entry, &query_id)? {
            Reconciliation::Finish(request) => report.finish.push(request),
            Reconciliation::Running => report.running += 1,
            Reconciliation::Resubmit => {
                report.resubmit += 1;
                self.forget_async_query(entry)?;
            }
            Reconciliation::Stale => {
                report.stale += 1;
                self.alerts.notify(&format!(
                    "ADC download cache: async query {query_id} for repertoire {} exceeded {}s, resubmitting",
                    entry.value.repertoire_id,
                    self.config.async_stale_after.as_secs()
                ));
                self.forget_async_query(entry)?;
            }
        }
        Ok(())
    }

    /// Drop the async query id so the next Cache run submits a fresh query.
    fn forget_async_query(&self, entry: &mut Stored<RepertoireCacheEntry>) -> Result<(), CacheError> {
        entry.value.async_query_id = None;
        entry.value.async_submitted_at = None;
        self.records.update_repertoire_entry(entry)
    }
}
