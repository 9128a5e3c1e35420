use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::{ArchiveInput, Archiver, partition_files, write_repertoire_metadata};
use crate::domain::{ArchiveFile, Artifact};
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::Message;
use crate::records::{EntryFilter, MetadataStore};
use crate::store::{CacheLayout, REPERTOIRE_METADATA_FILE, file_size};

use super::Pipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishStudyOutcome {
    Skipped,
    Cached { archives: Vec<String> },
}

impl FinishStudyOutcome {
    pub fn follow_up(&self) -> Option<Message> {
        match self {
            FinishStudyOutcome::Cached { .. } => Some(Message::Trigger),
            FinishStudyOutcome::Skipped => None,
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
    /// Bundle the repertoire metadata and every cached repertoire file of a
    /// study into one or more tar archives and publish them.
    pub fn process_finish_study(
        &self,
        study_cache_uuid: &str,
    ) -> Result<FinishStudyOutcome, CacheError> {
        let mut study = self
            .records
            .study_entry_by_uuid(study_cache_uuid)?
            .ok_or_else(|| {
                CacheError::EntryNotFound(format!("study cache entry {study_cache_uuid}"))
            })?;
        if !study.value.is_pending() {
            tracing::info!(study_id = %study.value.study_id, "study already finalized, skipping");
            return Ok(FinishStudyOutcome::Skipped);
        }

        let span = tracing::info_span!(
            "finish_study",
            repository_id = %study.value.repository_id,
            study_id = %study.value.study_id
        );
        let _guard = span.enter();

        let repository = self.repository(&study.value.repository_id)?;
        let mut repertoires = self.records.repertoire_entries(
            &EntryFilter::study(&study.value.repository_id, &study.value.study_id)
                .should_cache(true),
        )?;
        if let Some(pending) = repertoires
            .iter()
            .find(|entry| !entry.value.is_cached || entry.value.artifact.is_none())
        {
            return Err(CacheError::EntryNotReady(format!(
                "repertoire {} of study {} is not cached",
                pending.value.repertoire_id, study.value.study_id
            )));
        }

        let study_dir = self.layout.ensure_study_dir(&study.uuid)?;
        let removed = self.layout.remove_study_archives(&study.uuid)?;
        if removed > 0 {
            tracing::debug!(removed, "removed previous study archives");
        }

        let metadata = self
            .client
            .list_repertoires(repository, &study.value.study_id)?;
        let metadata_size =
            write_repertoire_metadata(&self.layout.repertoire_metadata_path(&study.uuid), &metadata)?;

        let mut inputs = vec![ArchiveInput {
            name: REPERTOIRE_METADATA_FILE.to_string(),
            size: metadata_size,
        }];
        for entry in &mut repertoires {
            let Some(artifact) = entry.value.artifact.as_mut() else {
                continue;
            };
            let name = artifact.archive_file.clone();
            let size = match artifact.file_size {
                Some(size) => size,
                None => {
                    let size = file_size(&study_dir.join(&name))?;
                    artifact.file_size = Some(size);
                    self.records.update_repertoire_entry(entry)?;
                    size
                }
            };
            inputs.push(ArchiveInput { name, size });
        }

        let partitions = partition_files(inputs, self.config.archive_cap_bytes);
        let mut files = Vec::with_capacity(partitions.len());
        for (index, partition) in partitions.iter().enumerate() {
            let names = partition
                .iter()
                .map(|input| input.name.clone())
                .collect::<Vec<_>>();
            let archive_file = self.archiver.create_tar_archive(
                &study_dir,
                &names,
                &CacheLayout::study_archive_name(index),
            )?;
            let path = study_dir.join(&archive_file);
            let link = self.links.create_forced_link(&self.file_url(&path)?)?;
            let size = file_size(&path)?;
            tracing::info!(%archive_file, files = names.len(), file_size = size, "study archive created");
            files.push(ArchiveFile {
                archive_file,
                postit_id: link.id,
                download_url: link.download_url,
                file_size: Some(size),
            });
        }

        let archives = files
            .iter()
            .map(|file| file.archive_file.clone())
            .collect::<Vec<_>>();
        study.value.artifact = Artifact::from_files(files);
        study.value.is_cached = true;
        self.records.update_study_entry(&study)?;

        tracing::info!(partitions = archives.len(), "study cached");
        Ok(FinishStudyOutcome::Cached { archives })
    }
}
