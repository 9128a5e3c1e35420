use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::Builder;

use crate::error::CacheError;

pub const REPERTOIRE_METADATA_FILE: &str = "repertoires.airr.json";

/// Path conventions for the cache tree:
/// `<cache_root>/<study_cache_uuid>/<repertoire_id>.airr.tsv.gz`,
/// `<cache_root>/<study_cache_uuid>/repertoires.airr.json` and
/// `<cache_root>/<study_cache_uuid>/study[<N>].tar`.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    cache_root: Utf8PathBuf,
}

impl CacheLayout {
    pub fn new(cache_root: Utf8PathBuf) -> Self {
        Self { cache_root }
    }

    pub fn default_root() -> Result<Utf8PathBuf, CacheError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir().join(".cache").join("adc-download-cache"),
                )
                .ok()
            })
            .ok_or_else(|| CacheError::Filesystem("unable to resolve cache directory".to_string()))
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn study_dir(&self, study_cache_uuid: &str) -> Utf8PathBuf {
        self.cache_root.join(study_cache_uuid)
    }

    pub fn repertoire_archive_name(repertoire_id: &str) -> String {
        format!("{repertoire_id}.airr.tsv.gz")
    }

    pub fn repertoire_archive_path(
        &self,
        study_cache_uuid: &str,
        repertoire_id: &str,
    ) -> Utf8PathBuf {
        self.study_dir(study_cache_uuid)
            .join(Self::repertoire_archive_name(repertoire_id))
    }

    pub fn repertoire_metadata_path(&self, study_cache_uuid: &str) -> Utf8PathBuf {
        self.study_dir(study_cache_uuid)
            .join(REPERTOIRE_METADATA_FILE)
    }

    /// `study.tar` for the first partition, `study2.tar`, `study3.tar`, ... after.
    pub fn study_archive_name(index: usize) -> String {
        if index == 0 {
            "study.tar".to_string()
        } else {
            format!("study{}.tar", index + 1)
        }
    }

    pub fn study_archive_path(&self, study_cache_uuid: &str, index: usize) -> Utf8PathBuf {
        self.study_dir(study_cache_uuid)
            .join(Self::study_archive_name(index))
    }

    /// Scratch space for downloads that have not been finalized yet.
    pub fn temp_dir(&self) -> Utf8PathBuf {
        self.cache_root.join(".tmp")
    }

    /// Path of a cached file relative to the cache root, used to build public file URLs.
    pub fn relative_path(&self, path: &Utf8Path) -> Result<Utf8PathBuf, CacheError> {
        path.strip_prefix(&self.cache_root)
            .map(Utf8Path::to_path_buf)
            .map_err(|_| {
                CacheError::Filesystem(format!("{path} is outside cache root {}", self.cache_root))
            })
    }

    pub fn ensure_cache_root(&self) -> Result<(), CacheError> {
        fs::create_dir_all(self.cache_root.as_std_path())
            .map_err(|err| CacheError::Filesystem(err.to_string()))
    }

    pub fn ensure_study_dir(&self, study_cache_uuid: &str) -> Result<Utf8PathBuf, CacheError> {
        let dir = self.study_dir(study_cache_uuid);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| CacheError::Filesystem(format!("create {dir}: {err}")))?;
        Ok(dir)
    }

    pub fn ensure_temp_dir(&self) -> Result<Utf8PathBuf, CacheError> {
        let dir = self.temp_dir();
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| CacheError::Filesystem(format!("create {dir}: {err}")))?;
        Ok(dir)
    }

    /// Delete `study.tar`, `study2.tar`, ... left by an earlier FinishStudy run.
    pub fn remove_study_archives(&self, study_cache_uuid: &str) -> Result<usize, CacheError> {
        let dir = self.study_dir(study_cache_uuid);
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(CacheError::Filesystem(format!("read {dir}: {err}"))),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::Filesystem(err.to_string()))?;
            let name = entry.file_name();
            if let Some(name) = name.to_str()
                && is_study_archive_name(name)
            {
                remove_file_if_exists(&dir.join(name))
                    .map_err(|err| CacheError::Filesystem(format!("remove {name}: {err}")))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn remove_study_dir(&self, study_cache_uuid: &str) -> Result<(), CacheError> {
        let dir = self.study_dir(study_cache_uuid);
        if dir.as_std_path().exists() {
            fs::remove_dir_all(dir.as_std_path())
                .map_err(|err| CacheError::Filesystem(format!("remove {dir}: {err}")))?;
        }
        Ok(())
    }
}

fn is_study_archive_name(name: &str) -> bool {
    name.strip_prefix("study")
        .and_then(|rest| rest.strip_suffix(".tar"))
        .is_some_and(|index| index.chars().all(|c| c.is_ascii_digit()))
}

pub fn file_size(path: &Utf8Path) -> Result<u64, CacheError> {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.len())
        .map_err(|err| CacheError::Filesystem(format!("stat {path}: {err}")))
}

/// Returns `Ok(false)` when the file was already gone.
pub fn remove_file_if_exists(path: &Utf8Path) -> io::Result<bool> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CacheError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| CacheError::Filesystem(format!("create {parent}: {err}")))?;
    let mut temp = Builder::new()
        .prefix(".adc-cache")
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CacheError::Filesystem(format!("temp file in {parent}: {err}")))?;
    temp.write_all(content)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|err| CacheError::Filesystem(format!("write {path}: {err}")))?;
    temp.persist(path.as_std_path())
        .map_err(|err| CacheError::Filesystem(format!("persist {path}: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = CacheLayout::new(Utf8PathBuf::from("/cache"));

        let rep = layout.repertoire_archive_path("study-uuid", "REP1");
        assert_eq!(rep, Utf8PathBuf::from("/cache/study-uuid/REP1.airr.tsv.gz"));

        let meta = layout.repertoire_metadata_path("study-uuid");
        assert!(meta.ends_with("study-uuid/repertoires.airr.json"));

        assert!(layout.study_archive_path("study-uuid", 0).ends_with("study.tar"));
        assert!(layout.study_archive_path("study-uuid", 1).ends_with("study2.tar"));
    }

    #[test]
    fn relative_path_requires_cache_root() {
        let layout = CacheLayout::new(Utf8PathBuf::from("/cache"));
        let relative = layout
            .relative_path(Utf8Path::new("/cache/abc/study.tar"))
            .unwrap();
        assert_eq!(relative, Utf8PathBuf::from("abc/study.tar"));
        assert!(layout.relative_path(Utf8Path::new("/elsewhere/x")).is_err());
    }

    #[test]
    fn removing_missing_file_is_not_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("gone.tsv")).unwrap();
        assert!(!remove_file_if_exists(&path).unwrap());

        std::fs::write(path.as_std_path(), b"x").unwrap();
        assert!(remove_file_if_exists(&path).unwrap());
    }

    #[test]
    fn atomic_write_replaces_content_without_scratch_files() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("nested").join("metadata.json");

        write_bytes_atomic(&path, b"[1]").unwrap();
        write_bytes_atomic(&path, b"[1, 2]").unwrap();

        assert_eq!(std::fs::read(path.as_std_path()).unwrap(), b"[1, 2]");
        let names = std::fs::read_dir(root.join("nested").as_std_path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["metadata.json"]);
    }

    #[test]
    fn removes_only_study_archives() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let layout = CacheLayout::new(root);
        let dir = layout.ensure_study_dir("s1").unwrap();
        for name in ["study.tar", "study2.tar", "REP1.airr.tsv.gz", "repertoires.airr.json"] {
            std::fs::write(dir.join(name).as_std_path(), b"x").unwrap();
        }

        assert_eq!(layout.remove_study_archives("s1").unwrap(), 2);
        assert!(dir.join("REP1.airr.tsv.gz").as_std_path().exists());
        assert!(!dir.join("study2.tar").as_std_path().exists());
        assert_eq!(layout.remove_study_archives("missing").unwrap(), 0);
    }
}
