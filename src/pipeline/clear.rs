use serde::Serialize;

use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::records::{EntryFilter, MetadataStore};

use super::Pipeline;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub study_cache_uuid: String,
    pub repertoires_removed: usize,
    pub link_failures: usize,
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
    /// Delete a study's cache directory, public links and cache records.
    /// The only place cache records are ever deleted.
    pub fn process_clear(
        &self,
        repository_id: &str,
        study_id: &str,
    ) -> Result<ClearReport, CacheError> {
        let span = tracing::info_span!("clear", repository_id, study_id);
        let _guard = span.enter();

        let mut studies = self
            .records
            .study_entries(&EntryFilter::study(repository_id, study_id))?;
        let study = match studies.len() {
            1 => studies.remove(0),
            0 => {
                return Err(CacheError::EntryNotFound(format!(
                    "study cache entry for repository {repository_id} study {study_id}"
                )));
            }
            count => {
                return Err(CacheError::DuplicateEntry(format!(
                    "{count} study cache entries for repository {repository_id} study {study_id}"
                )));
            }
        };
        let repertoires = self
            .records
            .repertoire_entries(&EntryFilter::study(repository_id, study_id))?;

        self.layout.remove_study_dir(&study.uuid)?;

        let mut report = ClearReport {
            study_cache_uuid: study.uuid.clone(),
            repertoires_removed: 0,
            link_failures: 0,
        };
        for entry in repertoires {
            if let Some(artifact) = &entry.value.artifact
                && !self.delete_link_non_fatal(&artifact.postit_id)
            {
                report.link_failures += 1;
            }
            self.records.delete_record(&entry.uuid)?;
            report.repertoires_removed += 1;
        }

        if let Some(artifact) = &study.value.artifact {
            for file in artifact.files() {
                if !self.delete_link_non_fatal(&file.postit_id) {
                    report.link_failures += 1;
                }
            }
        }
        self.records.delete_record(&study.uuid)?;

        tracing::info!(
            repertoires_removed = report.repertoires_removed,
            link_failures = report.link_failures,
            "study cache cleared"
        );
        Ok(report)
    }
}
