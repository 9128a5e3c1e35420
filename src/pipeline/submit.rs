use serde_json::Value;

use crate::adc::{RepositoryClient, local_project_uuid, repertoire_id_of};
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::domain::{RepertoireCacheEntry, Repository, StudyCacheEntry};
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::Message;
use crate::records::{EntryFilter, MetadataStore, index_unique};

use super::Pipeline;

/// The one unit of work a Submit run hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Cache { repertoire_cache_uuid: String },
    FinishStudy { study_cache_uuid: String },
    Idle,
}

impl SubmitOutcome {
    pub fn follow_up(&self) -> Option<Message> {
        match self {
            SubmitOutcome::Cache {
                repertoire_cache_uuid,
            } => Some(Message::Cache {
                repertoire_cache_uuid: repertoire_cache_uuid.clone(),
            }),
            SubmitOutcome::FinishStudy { study_cache_uuid } => Some(Message::FinishStudy {
                study_cache_uuid: study_cache_uuid.clone(),
            }),
            SubmitOutcome::Idle => None,
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
    /// Discover new studies and repertoires, then pick exactly one unit of work.
    /// "Not yet tracked" is recomputed from the store on every run, so an
    /// aborted run resumes where it stopped.
    pub fn process_submit(&self) -> Result<SubmitOutcome, CacheError> {
        for repository in self.repositories.iter().filter(|repo| repo.enable_cache) {
            let span = tracing::info_span!("submit", repository_id = %repository.repository_id);
            let _guard = span.enter();

            self.create_study_entries(repository)?;
            self.create_repertoire_entries(repository)?;

            let outcome = self.select_work(repository)?;
            if outcome != SubmitOutcome::Idle {
                tracing::info!(?outcome, "dispatching cache work");
                return Ok(outcome);
            }
        }
        tracing::info!("nothing left to cache");
        Ok(SubmitOutcome::Idle)
    }

    fn create_study_entries(&self, repository: &Repository) -> Result<(), CacheError> {
        let studies = self.client.list_studies(repository)?;
        let existing = index_unique(
            self.records
                .study_entries(&EntryFilter::all().repository(&repository.repository_id))?,
            |entry| entry.study_id.as_str(),
        )?;

        for study_id in studies.iter().filter(|id| !existing.contains_key(*id)) {
            let repertoires = self.client.list_repertoires(repository, study_id)?;
            if !self.study_is_loaded(&repertoires)? {
                tracing::info!(%study_id, "local project not fully loaded, skipping study");
                continue;
            }
            let entry = StudyCacheEntry::new(&repository.repository_id, study_id);
            let stored = self.records.create_study_entry(&entry)?;
            tracing::info!(%study_id, study_cache_uuid = %stored.uuid, "study cache entry created");
        }
        Ok(())
    }

    /// Studies from the local platform are only cached once their project
    /// metadata and rearrangements have both finished loading.
    fn study_is_loaded(&self, repertoires: &[Value]) -> Result<bool, CacheError> {
        let Some(project_uuid) = repertoires.iter().find_map(local_project_uuid) else {
            return Ok(true);
        };
        self.load_status.is_fully_loaded(project_uuid)
    }

    fn create_repertoire_entries(&self, repository: &Repository) -> Result<(), CacheError> {
        let studies = self.records.study_entries(
            &EntryFilter::all()
                .repository(&repository.repository_id)
                .pending(),
        )?;

        for study in studies {
            let study_id = study.value.study_id.as_str();
            let repertoires = self.client.list_repertoires(repository, study_id)?;
            let existing = index_unique(
                self.records
                    .repertoire_entries(&EntryFilter::study(&repository.repository_id, study_id))?,
                |entry| entry.repertoire_id.as_str(),
            )?;

            for repertoire in &repertoires {
                let Some(repertoire_id) = repertoire_id_of(repertoire) else {
                    tracing::warn!(study_id, "repertoire without repertoire_id, skipping");
                    continue;
                };
                if existing.contains_key(repertoire_id) {
                    continue;
                }
                let entry =
                    RepertoireCacheEntry::new(&repository.repository_id, study_id, repertoire_id);
                self.records.create_repertoire_entry(&entry, &study.uuid)?;
                tracing::debug!(study_id, repertoire_id, "repertoire cache entry created");
            }
        }
        Ok(())
    }

    fn select_work(&self, repository: &Repository) -> Result<SubmitOutcome, CacheError> {
        let studies = self.records.study_entries(
            &EntryFilter::all()
                .repository(&repository.repository_id)
                .pending(),
        )?;
        let Some(study) = studies.into_iter().next() else {
            return Ok(SubmitOutcome::Idle);
        };

        let repertoires = self.records.repertoire_entries(
            &EntryFilter::study(&repository.repository_id, &study.value.study_id)
                .should_cache(true),
        )?;
        match repertoires.iter().find(|entry| !entry.value.is_cached) {
            Some(entry) => Ok(SubmitOutcome::Cache {
                repertoire_cache_uuid: entry.uuid.clone(),
            }),
            None => Ok(SubmitOutcome::FinishStudy {
                study_cache_uuid: study.uuid,
            }),
        }
    }
}
