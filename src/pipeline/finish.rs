use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::{Archiver, gzip_file};
use crate::domain::ArchiveFile;
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::{FinishRequest, FinishSource, Message};
use crate::records::MetadataStore;
use crate::store::{CacheLayout, file_size};

use super::Pipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Entry was already cached or is not meant to be.
    Skipped,
    Cached { archive_file: String, file_size: u64 },
}

impl FinishOutcome {
    pub fn follow_up(&self) -> Option<Message> {
        match self {
            FinishOutcome::Cached { .. } => Some(Message::Trigger),
            FinishOutcome::Skipped => None,
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
    /// Compress, publish and mark one repertoire cached. Safe to call again
    /// for an entry that is already cached.
    pub fn process_finish(&self, request: &FinishRequest) -> Result<FinishOutcome, CacheError> {
        let mut entry = self
            .records
            .repertoire_entry(&request.repertoire_cache_uuid)?
            .ok_or_else(|| {
                CacheError::EntryNotFound(format!(
                    "repertoire cache entry {}",
                    request.repertoire_cache_uuid
                ))
            })?;
        if !entry.value.should_cache || entry.value.is_cached {
            tracing::info!(
                repertoire_id = %entry.value.repertoire_id,
                "repertoire already finalized, skipping"
            );
            return Ok(FinishOutcome::Skipped);
        }

        let span = tracing::info_span!(
            "finish",
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

        let (source, delete_source) = match &request.source {
            FinishSource::LocalFile {
                final_file,
                delete_file,
            } => (final_file.clone(), *delete_file),
            FinishSource::AsyncResult {
                query_id,
                final_file,
            } => {
                if entry.value.async_query_id.as_deref() != Some(query_id.as_str()) {
                    return Err(CacheError::QueryMismatch {
                        expected: entry.value.async_query_id.clone().unwrap_or_default(),
                        actual: query_id.clone(),
                    });
                }
                let repository = self.repository(&entry.value.repository_id)?;
                let destination = self.download_path(&entry.uuid)?;
                if let Err(err) = self.client.download_async_result(
                    repository,
                    final_file,
                    destination.as_std_path(),
                ) {
                    self.discard_download(&destination);
                    return Err(err);
                }
                (destination, true)
            }
        };

        let archive_file = CacheLayout::repertoire_archive_name(&entry.value.repertoire_id);
        let destination = self.layout.ensure_study_dir(&study.uuid)?.join(&archive_file);
        gzip_file(&source, &destination)?;
        if delete_source {
            self.discard_download(&source);
        }

        let link = self.links.create_forced_link(&self.file_url(&destination)?)?;
        let size = file_size(&destination)?;

        entry.value.artifact = Some(ArchiveFile {
            archive_file: archive_file.clone(),
            postit_id: link.id,
            download_url: link.download_url,
            file_size: Some(size),
        });
        entry.value.async_query_id = None;
        entry.value.async_submitted_at = None;
        entry.value.is_cached = true;
        self.records.update_repertoire_entry(&entry)?;

        tracing::info!(%archive_file, file_size = size, "repertoire cached");
        Ok(FinishOutcome::Cached {
            archive_file,
            file_size: size,
        })
    }
}
