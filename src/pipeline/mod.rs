//! Queue processors for the ADC download cache.
//!
//! Trigger → Submit → Cache → Finish → Trigger ... → FinishStudy → Trigger.
//! Every stage reloads its record before mutating it, so duplicate or
//! out-of-order delivery is harmless. `is_cached` is only ever set at the end
//! of Finish and FinishStudy.

mod admin;
mod cache;
mod clear;
mod finish;
mod finish_study;
mod notify;
mod recache;
mod submit;
mod sweep;
mod trigger;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::config::{PipelineSettings, Schedule};
use crate::domain::Repository;
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::{JobQueues, Message};
use crate::records::{CacheRecords, MetadataStore};
use crate::settings::SettingsService;
use crate::store::{CacheLayout, remove_file_if_exists};

pub use admin::{CacheStatus, CachedStudy};
pub use cache::CacheOutcome;
pub use clear::ClearReport;
pub use finish::FinishOutcome;
pub use finish_study::FinishStudyOutcome;
pub use notify::NotifyOutcome;
pub use submit::SubmitOutcome;
pub use sweep::{Reconciliation, SweepReport};
pub use trigger::TriggerOutcome;

const SETTINGS_MAX_AGE: Duration = Duration::from_secs(60);

/// External services the pipeline talks to.
pub struct Collaborators<C, P, L, A, R> {
    pub client: C,
    pub links: P,
    pub load_status: L,
    pub alerts: A,
    pub archiver: R,
}

pub struct Pipeline<S, C, P, L, A, R>
where
    S: MetadataStore + Clone,
{
    records: CacheRecords<S>,
    settings: SettingsService<S>,
    repositories: Vec<Repository>,
    client: C,
    links: P,
    load_status: L,
    alerts: A,
    archiver: R,
    layout: CacheLayout,
    queues: Arc<JobQueues>,
    config: PipelineSettings,
    schedule: Schedule,
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
    pub fn new(
        store: S,
        collaborators: Collaborators<C, P, L, A, R>,
        layout: CacheLayout,
        repositories: Vec<Repository>,
        config: PipelineSettings,
        schedule: Schedule,
    ) -> Self {
        let records = CacheRecords::new(store);
        let settings = SettingsService::new(records.clone(), SETTINGS_MAX_AGE);
        Self {
            records,
            settings,
            repositories,
            client: collaborators.client,
            links: collaborators.links,
            load_status: collaborators.load_status,
            alerts: collaborators.alerts,
            archiver: collaborators.archiver,
            layout,
            queues: Arc::new(JobQueues::new()),
            config,
            schedule,
        }
    }

    pub fn records(&self) -> &CacheRecords<S> {
        &self.records
    }

    pub fn settings(&self) -> &SettingsService<S> {
        &self.settings
    }

    pub fn queues(&self) -> &Arc<JobQueues> {
        &self.queues
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn enqueue(&self, message: Message) -> u64 {
        self.queues.enqueue(message)
    }

    fn repository(&self, repository_id: &str) -> Result<&Repository, CacheError> {
        self.repositories
            .iter()
            .find(|repo| repo.repository_id == repository_id)
            .ok_or_else(|| CacheError::UnknownRepository(repository_id.to_string()))
    }

    /// Public URL of a file inside the cache tree.
    fn file_url(&self, path: &Utf8Path) -> Result<String, CacheError> {
        let relative = self.layout.relative_path(path)?;
        Ok(format!("{}/{}", self.config.file_base_url, relative))
    }

    /// Scratch file a repertoire's rearrangements are downloaded to.
    fn download_path(&self, repertoire_cache_uuid: &str) -> Result<Utf8PathBuf, CacheError> {
        Ok(self
            .layout
            .ensure_temp_dir()?
            .join(format!("{repertoire_cache_uuid}.airr.tsv")))
    }

    /// Remove a scratch file; a file that is already gone is fine.
    fn discard_download(&self, path: &Utf8Path) {
        match remove_file_if_exists(path) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(%path, "temporary file already removed"),
            Err(err) => self.report_non_fatal(&format!("remove temporary file {path}"), &err),
        }
    }

    /// Returns false when the link could not be deleted.
    fn delete_link_non_fatal(&self, postit_id: &str) -> bool {
        match self.links.delete_link(postit_id) {
            Ok(()) => true,
            Err(err) => {
                self.report_non_fatal(&format!("delete public link {postit_id}"), &err);
                false
            }
        }
    }

    /// Log and alert; used for failures that abort a stage.
    fn report(&self, context: &str, err: &CacheError) {
        tracing::error!(context, error = %err, data_error = err.is_data_error(), "stage failed");
        self.alerts.notify(&format!("ADC download cache: {context}: {err}"));
    }

    /// Log and alert; used for cleanup failures the stage continues past.
    fn report_non_fatal(&self, context: &str, err: &dyn std::fmt::Display) {
        tracing::warn!(context, error = %err, "continuing after failure");
        self.alerts.notify(&format!("ADC download cache: {context}: {err}"));
    }
}
