use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::records::MetadataStore;

use super::Pipeline;

impl<S, C, P, L, A, R> Pipeline<S, C, P, L, A, R>
where
    S: MetadataStore + Clone,
    C: RepositoryClient,
    P: PublicLinkService,
    L: ProjectLoadStatus,
    A: AlertSink,
    R: Archiver,
{
    /// Force the study archive to be rebuilt on the next cycle after its
    /// repertoire metadata changed. Cached repertoire files are reused as is.
    pub fn recache_study_metadata(
        &self,
        repository_id: &str,
        study_id: &str,
    ) -> Result<(), CacheError> {
        let mut study = self
            .records
            .study_entry(repository_id, study_id)?
            .ok_or_else(|| {
                CacheError::EntryNotFound(format!(
                    "study cache entry for repository {repository_id} study {study_id}"
                ))
            })?;

        if let Some(artifact) = study.value.artifact.take() {
            for file in artifact.files() {
                self.delete_link_non_fatal(&file.postit_id);
            }
        }
        study.value.is_cached = false;
        self.records.update_study_entry(&study)?;

        tracing::info!(repository_id, study_id, "study archive marked for rebuild");
        Ok(())
    }
}
