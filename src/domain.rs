use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ADC repository the cache mirrors. Loaded from config, never written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub repository_id: String,
    pub server_host: String,
    pub base_url: String,
    #[serde(default)]
    pub async_host: Option<String>,
    #[serde(default)]
    pub async_base_url: Option<String>,
    #[serde(default)]
    pub supports_async: bool,
    #[serde(default)]
    pub enable_cache: bool,
}

impl Repository {
    pub fn query_url(&self, endpoint: &str) -> String {
        format!(
            "https://{}{}/{}",
            self.server_host,
            self.base_url.trim_end_matches('/'),
            endpoint
        )
    }

    /// `None` when the repository has no async host configured.
    pub fn async_url(&self, endpoint: &str) -> Option<String> {
        let host = self.async_host.as_deref()?;
        let base = self.async_base_url.as_deref().unwrap_or("");
        Some(format!(
            "https://{}{}/{}",
            host,
            base.trim_end_matches('/'),
            endpoint
        ))
    }

    pub fn uses_async(&self) -> bool {
        self.supports_async && self.async_host.is_some()
    }
}

/// Singleton configuration record toggled by operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enable_cache: bool,
}

/// A metadata record uuid paired with its decoded value.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub uuid: String,
    pub value: T,
}

/// One publicly downloadable file in the cache tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub archive_file: String,
    pub postit_id: String,
    pub download_url: String,
    pub file_size: Option<u64>,
}

/// A study archive is a single tar or, past the size cap, several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Single(ArchiveFile),
    Partitioned(Vec<ArchiveFile>),
}

impl Artifact {
    pub fn from_files(mut files: Vec<ArchiveFile>) -> Option<Self> {
        match files.len() {
            0 => None,
            1 => files.pop().map(Artifact::Single),
            _ => Some(Artifact::Partitioned(files)),
        }
    }

    pub fn files(&self) -> &[ArchiveFile] {
        match self {
            Artifact::Single(file) => std::slice::from_ref(file),
            Artifact::Partitioned(files) => files,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StudyCacheRecord", into = "StudyCacheRecord")]
pub struct StudyCacheEntry {
    pub repository_id: String,
    pub study_id: String,
    pub should_cache: bool,
    pub is_cached: bool,
    pub artifact: Option<Artifact>,
}

impl StudyCacheEntry {
    pub fn new(repository_id: &str, study_id: &str) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            study_id: study_id.to_string(),
            should_cache: true,
            is_cached: false,
            artifact: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.should_cache && !self.is_cached
    }
}

// Record shape kept by the metadata store: scalar fields for one archive,
// parallel arrays when the study was split.
#[derive(Serialize, Deserialize)]
struct StudyCacheRecord {
    repository_id: String,
    study_id: String,
    #[serde(default = "default_true")]
    should_cache: bool,
    #[serde(default)]
    is_cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    archive_file: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    postit_id: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    download_url: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_size: Option<OneOrMany<u64>>,
}

impl TryFrom<StudyCacheRecord> for StudyCacheEntry {
    type Error = String;

    fn try_from(record: StudyCacheRecord) -> Result<Self, Self::Error> {
        use OneOrMany::{Many, One};

        let artifact = match (
            record.archive_file,
            record.postit_id,
            record.download_url,
            record.file_size,
        ) {
            (None, _, _, _) => None,
            (Some(One(archive_file)), Some(One(postit_id)), Some(One(download_url)), size) => {
                let file_size = match size {
                    None => None,
                    Some(One(size)) => Some(size),
                    Some(Many(_)) => {
                        return Err("file_size is an array for a single archive".to_string());
                    }
                };
                Some(Artifact::Single(ArchiveFile {
                    archive_file,
                    postit_id,
                    download_url,
                    file_size,
                }))
            }
            (Some(Many(archives)), Some(Many(postits)), Some(Many(urls)), sizes) => {
                let sizes = match sizes {
                    None => vec![None; archives.len()],
                    Some(Many(sizes)) => sizes.into_iter().map(Some).collect(),
                    Some(One(_)) => {
                        return Err("file_size is a scalar for a partitioned archive".to_string());
                    }
                };
                if postits.len() != archives.len()
                    || urls.len() != archives.len()
                    || sizes.len() != archives.len()
                {
                    return Err(format!(
                        "partition arrays differ in length ({} archives)",
                        archives.len()
                    ));
                }
                let files = archives
                    .into_iter()
                    .zip(postits)
                    .zip(urls)
                    .zip(sizes)
                    .map(
                        |(((archive_file, postit_id), download_url), file_size)| ArchiveFile {
                            archive_file,
                            postit_id,
                            download_url,
                            file_size,
                        },
                    )
                    .collect();
                Artifact::from_files(files)
            }
            _ => return Err("archive fields mix scalar and array values".to_string()),
        };

        Ok(Self {
            repository_id: record.repository_id,
            study_id: record.study_id,
            should_cache: record.should_cache,
            is_cached: record.is_cached,
            artifact,
        })
    }
}

impl From<StudyCacheEntry> for StudyCacheRecord {
    fn from(entry: StudyCacheEntry) -> Self {
        let mut record = StudyCacheRecord {
            repository_id: entry.repository_id,
            study_id: entry.study_id,
            should_cache: entry.should_cache,
            is_cached: entry.is_cached,
            archive_file: None,
            postit_id: None,
            download_url: None,
            file_size: None,
        };
        match entry.artifact {
            None => {}
            Some(Artifact::Single(file)) => {
                record.archive_file = Some(OneOrMany::One(file.archive_file));
                record.postit_id = Some(OneOrMany::One(file.postit_id));
                record.download_url = Some(OneOrMany::One(file.download_url));
                record.file_size = file.file_size.map(OneOrMany::One);
            }
            Some(Artifact::Partitioned(files)) => {
                let sizes = files
                    .iter()
                    .map(|file| file.file_size)
                    .collect::<Option<Vec<_>>>();
                record.archive_file = Some(OneOrMany::Many(
                    files.iter().map(|file| file.archive_file.clone()).collect(),
                ));
                record.postit_id = Some(OneOrMany::Many(
                    files.iter().map(|file| file.postit_id.clone()).collect(),
                ));
                record.download_url = Some(OneOrMany::Many(
                    files.iter().map(|file| file.download_url.clone()).collect(),
                ));
                record.file_size = sizes.map(OneOrMany::Many);
            }
        }
        record
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RepertoireCacheRecord", into = "RepertoireCacheRecord")]
pub struct RepertoireCacheEntry {
    pub repository_id: String,
    pub study_id: String,
    pub repertoire_id: String,
    pub should_cache: bool,
    pub is_cached: bool,
    pub async_query_id: Option<String>,
    pub async_submitted_at: Option<DateTime<Utc>>,
    pub artifact: Option<ArchiveFile>,
}

impl RepertoireCacheEntry {
    pub fn new(repository_id: &str, study_id: &str, repertoire_id: &str) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            study_id: study_id.to_string(),
            repertoire_id: repertoire_id.to_string(),
            should_cache: true,
            is_cached: false,
            async_query_id: None,
            async_submitted_at: None,
            artifact: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.should_cache && !self.is_cached
    }
}

#[derive(Serialize, Deserialize)]
struct RepertoireCacheRecord {
    repository_id: String,
    study_id: String,
    repertoire_id: String,
    #[serde(default = "default_true")]
    should_cache: bool,
    #[serde(default)]
    is_cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    async_query_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    async_submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    archive_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    postit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_size: Option<u64>,
}

impl From<RepertoireCacheRecord> for RepertoireCacheEntry {
    fn from(record: RepertoireCacheRecord) -> Self {
        let artifact = match (record.archive_file, record.postit_id, record.download_url) {
            (Some(archive_file), Some(postit_id), Some(download_url)) => Some(ArchiveFile {
                archive_file,
                postit_id,
                download_url,
                file_size: record.file_size,
            }),
            _ => None,
        };
        Self {
            repository_id: record.repository_id,
            study_id: record.study_id,
            repertoire_id: record.repertoire_id,
            should_cache: record.should_cache,
            is_cached: record.is_cached,
            async_query_id: record.async_query_id,
            async_submitted_at: record.async_submitted_at,
            artifact,
        }
    }
}

impl From<RepertoireCacheEntry> for RepertoireCacheRecord {
    fn from(entry: RepertoireCacheEntry) -> Self {
        let (archive_file, postit_id, download_url, file_size) = match entry.artifact {
            Some(file) => (
                Some(file.archive_file),
                Some(file.postit_id),
                Some(file.download_url),
                file.file_size,
            ),
            None => (None, None, None, None),
        };
        Self {
            repository_id: entry.repository_id,
            study_id: entry.study_id,
            repertoire_id: entry.repertoire_id,
            should_cache: entry.should_cache,
            is_cached: entry.is_cached,
            async_query_id: entry.async_query_id,
            async_submitted_at: entry.async_submitted_at,
            archive_file,
            postit_id,
            download_url,
            file_size,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncState {
    Pending,
    Submitted,
    Running,
    Counting,
    Finished,
    Error,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for AsyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AsyncState::Pending => "PENDING",
            AsyncState::Submitted => "SUBMITTED",
            AsyncState::Running => "RUNNING",
            AsyncState::Counting => "COUNTING",
            AsyncState::Finished => "FINISHED",
            AsyncState::Error => "ERROR",
            AsyncState::Unknown => "UNKNOWN",
        };
        write!(f, "{label}")
    }
}

/// Status document returned by the async query API and posted in notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncQueryStatus {
    pub query_id: String,
    pub status: AsyncState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_file: Option<String>,
}
