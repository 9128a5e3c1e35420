use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};

use camino::Utf8Path;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use tempfile::Builder;

use crate::error::CacheError;
use crate::store::{file_size, write_bytes_atomic};

/// 50 GiB, the largest study tar handed out as one download.
pub const DEFAULT_ARCHIVE_CAP_BYTES: u64 = 50 * 1024 * 1024 * 1024;

/// A file in a study directory waiting to be packed into a tar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInput {
    pub name: String,
    pub size: u64,
}

/// Sequential first-fit: files stay in the current partition until the next
/// one would push it past `cap`. A file larger than `cap` gets a partition
/// of its own.
pub fn partition_files(files: Vec<ArchiveInput>, cap: u64) -> Vec<Vec<ArchiveInput>> {
    let mut partitions = Vec::new();
    let mut current: Vec<ArchiveInput> = Vec::new();
    let mut total = 0u64;
    for file in files {
        if !current.is_empty() && total.saturating_add(file.size) > cap {
            partitions.push(std::mem::take(&mut current));
            total = 0;
        }
        total = total.saturating_add(file.size);
        current.push(file);
    }
    if !current.is_empty() {
        partitions.push(current);
    }
    partitions
}

/// Compress `source` into `destination` and return the compressed size.
pub fn gzip_file(source: &Utf8Path, destination: &Utf8Path) -> Result<u64, CacheError> {
    let parent = destination
        .parent()
        .ok_or_else(|| CacheError::Filesystem("invalid destination path".to_string()))?;
    let input = File::open(source.as_std_path())
        .map_err(|err| CacheError::Filesystem(format!("open {source}: {err}")))?;
    let temp = Builder::new()
        .prefix("adc-cache-gz")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CacheError::Filesystem(err.to_string()))?;

    {
        let mut encoder = GzEncoder::new(BufWriter::new(temp.as_file()), Compression::default());
        io::copy(&mut BufReader::new(input), &mut encoder)
            .map_err(|err| CacheError::Archive(format!("compress {source}: {err}")))?;
        let mut writer = encoder
            .finish()
            .map_err(|err| CacheError::Archive(format!("compress {source}: {err}")))?;
        writer
            .flush()
            .map_err(|err| CacheError::Archive(format!("compress {source}: {err}")))?;
    }

    temp.persist(destination.as_std_path())
        .map_err(|err| CacheError::Filesystem(format!("persist {destination}: {err}")))?;
    file_size(destination)
}

/// Write the AIRR repertoire listing that accompanies a study archive.
pub fn write_repertoire_metadata(path: &Utf8Path, repertoires: &[Value]) -> Result<u64, CacheError> {
    let document = json!({
        "Info": {
            "title": "AIRR Data Commons download cache",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "Repertoire": repertoires,
    });
    let content = serde_json::to_vec_pretty(&document)
        .map_err(|err| CacheError::Archive(err.to_string()))?;
    write_bytes_atomic(path, &content)?;
    Ok(content.len() as u64)
}

pub trait Archiver: Send + Sync {
    /// Pack `files` (names relative to `work_dir`) into `work_dir/archive_name`.
    fn create_tar_archive(
        &self,
        work_dir: &Utf8Path,
        files: &[String],
        archive_name: &str,
    ) -> Result<String, CacheError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TarArchiver;

impl Archiver for TarArchiver {
    fn create_tar_archive(
        &self,
        work_dir: &Utf8Path,
        files: &[String],
        archive_name: &str,
    ) -> Result<String, CacheError> {
        let temp = Builder::new()
            .prefix("adc-cache-tar")
            .tempfile_in(work_dir.as_std_path())
            .map_err(|err| CacheError::Filesystem(err.to_string()))?;
        {
            let mut builder = tar::Builder::new(BufWriter::new(temp.as_file()));
            builder.follow_symlinks(false);
            for name in files {
                let path = work_dir.join(name);
                builder
                    .append_path_with_name(path.as_std_path(), name)
                    .map_err(|err| CacheError::Archive(format!("add {name}: {err}")))?;
            }
            let mut writer = builder
                .into_inner()
                .map_err(|err| CacheError::Archive(format!("finish {archive_name}: {err}")))?;
            writer
                .flush()
                .map_err(|err| CacheError::Archive(format!("finish {archive_name}: {err}")))?;
        }
        let destination = work_dir.join(archive_name);
        temp.persist(destination.as_std_path())
            .map_err(|err| CacheError::Filesystem(format!("persist {destination}: {err}")))?;
        Ok(archive_name.to_string())
    }
}
