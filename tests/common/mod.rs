#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde_json::{Value, json};
use tempfile::TempDir;

use adc_download_cache::adc::RepositoryClient;
use adc_download_cache::alert::AlertSink;
use adc_download_cache::archive::TarArchiver;
use adc_download_cache::config::{PipelineSettings, Schedule};
use adc_download_cache::domain::{AsyncQueryStatus, AsyncState, Repository};
use adc_download_cache::error::CacheError;
use adc_download_cache::load_status::ProjectLoadStatus;
use adc_download_cache::pipeline::{Collaborators, Pipeline};
use adc_download_cache::postit::{PublicLink, PublicLinkService};
use adc_download_cache::records::JsonFileMetadataStore;
use adc_download_cache::store::CacheLayout;

pub type TestPipeline = Pipeline<
    Arc<JsonFileMetadataStore>,
    Arc<MockRepository>,
    Arc<MockLinks>,
    Arc<MockLoadStatus>,
    Arc<RecordingAlerts>,
    TarArchiver,
>;

#[derive(Default)]
pub struct MockRepository {
    pub studies: Mutex<Vec<String>>,
    pub repertoires: Mutex<HashMap<String, Vec<Value>>>,
    pub downloads: Mutex<Vec<String>>,
    pub submissions: Mutex<Vec<(String, String)>>,
    pub statuses: Mutex<HashMap<String, AsyncQueryStatus>>,
    pub result_downloads: Mutex<Vec<String>>,
    pub fail_listing: Mutex<bool>,
}

impl MockRepository {
    pub fn add_study(&self, study_id: &str, repertoires: &[Value]) {
        self.studies.lock().unwrap().push(study_id.to_string());
        self.repertoires
            .lock()
            .unwrap()
            .insert(study_id.to_string(), repertoires.to_vec());
    }

    pub fn set_status(&self, query_id: &str, status: AsyncState, final_file: Option<&str>) {
        self.statuses.lock().unwrap().insert(
            query_id.to_string(),
            AsyncQueryStatus {
                query_id: query_id.to_string(),
                status,
                final_file: final_file.map(str::to_string),
            },
        );
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl RepositoryClient for MockRepository {
    fn list_studies(&self, _repository: &Repository) -> Result<Vec<String>, CacheError> {
        if *self.fail_listing.lock().unwrap() {
            return Err(CacheError::AdcStatus {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(self.studies.lock().unwrap().clone())
    }

    fn list_repertoires(
        &self,
        _repository: &Repository,
        study_id: &str,
    ) -> Result<Vec<Value>, CacheError> {
        Ok(self
            .repertoires
            .lock()
            .unwrap()
            .get(study_id)
            .cloned()
            .unwrap_or_default())
    }

    fn download_rearrangements(
        &self,
        _repository: &Repository,
        repertoire_id: &str,
        destination: &Path,
    ) -> Result<(), CacheError> {
        self.downloads
            .lock()
            .unwrap()
            .push(repertoire_id.to_string());
        std::fs::write(destination, rearrangements(repertoire_id))
            .map_err(|err| CacheError::Filesystem(err.to_string()))
    }

    fn submit_async_query(
        &self,
        _repository: &Repository,
        repertoire_id: &str,
        notify_url: &str,
    ) -> Result<String, CacheError> {
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push((repertoire_id.to_string(), notify_url.to_string()));
        Ok(format!("q{}", submissions.len()))
    }

    fn poll_async_status(
        &self,
        _repository: &Repository,
        query_id: &str,
    ) -> Result<AsyncQueryStatus, CacheError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(query_id)
            .cloned()
            .unwrap_or_else(|| AsyncQueryStatus {
                query_id: query_id.to_string(),
                status: AsyncState::Running,
                final_file: None,
            }))
    }

    fn download_async_result(
        &self,
        _repository: &Repository,
        final_file: &str,
        destination: &Path,
    ) -> Result<(), CacheError> {
        self.result_downloads
            .lock()
            .unwrap()
            .push(final_file.to_string());
        std::fs::write(destination, rearrangements(final_file))
            .map_err(|err| CacheError::Filesystem(err.to_string()))
    }
}

#[derive(Default)]
pub struct MockLinks {
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail_delete: Mutex<bool>,
}

impl MockLinks {
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl PublicLinkService for MockLinks {
    fn create_forced_link(&self, file_url: &str) -> Result<PublicLink, CacheError> {
        let mut created = self.created.lock().unwrap();
        created.push(file_url.to_string());
        let id = format!("postit-{}", created.len());
        Ok(PublicLink {
            download_url: format!("https://postit.example.org/{id}"),
            id,
        })
    }

    fn delete_link(&self, id: &str) -> Result<(), CacheError> {
        if *self.fail_delete.lock().unwrap() {
            return Err(CacheError::PostitStatus {
                status: 500,
                message: "boom".to_string(),
            });
        }
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockLoadStatus {
    pub loaded: Mutex<HashMap<String, bool>>,
}

impl ProjectLoadStatus for MockLoadStatus {
    fn is_fully_loaded(&self, project_uuid: &str) -> Result<bool, CacheError> {
        Ok(self
            .loaded
            .lock()
            .unwrap()
            .get(project_uuid)
            .copied()
            .unwrap_or(false))
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub messages: Mutex<Vec<String>>,
}

impl RecordingAlerts {
    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl AlertSink for RecordingAlerts {
    fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub store: Arc<JsonFileMetadataStore>,
    pub client: Arc<MockRepository>,
    pub links: Arc<MockLinks>,
    pub load_status: Arc<MockLoadStatus>,
    pub alerts: Arc<RecordingAlerts>,
    pub pipeline: TestPipeline,
}

impl Harness {
    pub fn new(repository: Repository) -> Self {
        Self::with_settings(repository, settings())
    }

    pub fn with_settings(repository: Repository, settings: PipelineSettings) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let cache_root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
        let store = Arc::new(JsonFileMetadataStore::in_memory());
        let client = Arc::new(MockRepository::default());
        let links = Arc::new(MockLinks::default());
        let load_status = Arc::new(MockLoadStatus::default());
        let alerts = Arc::new(RecordingAlerts::default());

        let pipeline = Pipeline::new(
            Arc::clone(&store),
            Collaborators {
                client: Arc::clone(&client),
                links: Arc::clone(&links),
                load_status: Arc::clone(&load_status),
                alerts: Arc::clone(&alerts),
                archiver: TarArchiver,
            },
            CacheLayout::new(cache_root),
            vec![repository],
            settings,
            Schedule::default(),
        );
        Self {
            temp,
            store,
            client,
            links,
            load_status,
            alerts,
            pipeline,
        }
    }

    pub fn sync() -> Self {
        Self::new(sync_repository())
    }

    pub fn asynchronous() -> Self {
        Self::new(async_repository())
    }

    pub fn study_dir(&self, study_cache_uuid: &str) -> Utf8PathBuf {
        self.pipeline.layout().study_dir(study_cache_uuid)
    }
}

pub fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::new("https://files.example.org/cache/");
    settings.notify_base_url = Some("https://cache.example.org/api".to_string());
    settings
}

pub fn sync_repository() -> Repository {
    Repository {
        repository_id: "R1".to_string(),
        server_host: "adc.example.org".to_string(),
        base_url: "/airr/v1".to_string(),
        async_host: None,
        async_base_url: None,
        supports_async: false,
        enable_cache: true,
    }
}

pub fn async_repository() -> Repository {
    Repository {
        async_host: Some("adc-async.example.org".to_string()),
        async_base_url: Some("/airr/async/v1".to_string()),
        supports_async: true,
        ..sync_repository()
    }
}

pub fn repertoire(study_id: &str, repertoire_id: &str) -> Value {
    json!({
        "repertoire_id": repertoire_id,
        "study": { "study_id": study_id },
        "subject": { "subject_id": format!("subject-{repertoire_id}") }
    })
}

pub fn local_repertoire(study_id: &str, repertoire_id: &str, project_uuid: &str) -> Value {
    json!({
        "repertoire_id": repertoire_id,
        "study": { "study_id": study_id, "vdjserver_uuid": project_uuid }
    })
}

pub fn rearrangements(repertoire_id: &str) -> String {
    format!("sequence_id\trepertoire_id\tsequence\nseq1\t{repertoire_id}\tACGTACGT\n")
}
