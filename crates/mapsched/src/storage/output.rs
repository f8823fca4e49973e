use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::error::StorageError;

/// Suffix appended to a files prefix for the preview image.
pub const THUMBNAIL_SUFFIX: &str = "_small.png";

/// Format whose file is an index rather than a map.
const INDEX_FORMAT: &str = "csv";

/// One rendered file of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub format: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Output files of a job that currently exist on disk, split into map
/// renderings and street indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputFiles {
    pub maps: Vec<OutputFile>,
    pub indexes: Vec<OutputFile>,
}

impl OutputFiles {
    pub fn len(&self) -> usize {
        self.maps.len() + self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputFile> {
        self.maps.iter().chain(self.indexes.iter())
    }

    pub fn total_size(&self) -> u64 {
        self.iter().map(|f| f.size).sum()
    }
}

/// A file found while scanning the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Returns true for preview images, which the collector never evicts.
pub fn is_thumbnail(name: &str) -> bool {
    name.ends_with(THUMBNAIL_SUFFIX)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Removes a file, treating an already-missing file as success.
/// Returns whether this call removed it.
pub fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::RemoveFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// The shared rendering output directory and the formats every job is
/// rendered into. Paths are always re-derived from a job's files prefix;
/// nothing about the directory contents is cached.
#[derive(Debug, Clone)]
pub struct OutputStorage {
    directory: PathBuf,
    formats: Vec<String>,
}

impl OutputStorage {
    pub fn new<P: AsRef<Path>>(directory: P, formats: Vec<String>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            formats,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn formats(&self) -> &[String] {
        &self.formats
    }

    /// Fails unless the output directory exists and is a directory.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.directory.is_dir() {
            Ok(())
        } else {
            Err(StorageError::InvalidOutputDirectory(self.directory.clone()))
        }
    }

    /// `{directory}/{prefix}.{format}`
    pub fn file_path(&self, prefix: &str, format: &str) -> PathBuf {
        self.directory.join(format!("{}.{}", prefix, format))
    }

    /// `{directory}/{prefix}_small.png`
    pub fn thumbnail_path(&self, prefix: &str) -> PathBuf {
        self.directory.join(format!("{}{}", prefix, THUMBNAIL_SUFFIX))
    }

    /// Lists the output files of `prefix` that exist right now.
    pub fn output_files(&self, prefix: &str) -> OutputFiles {
        let mut files = OutputFiles::default();
        for format in &self.formats {
            let path = self.file_path(prefix, format);
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let file = OutputFile {
                format: format.clone(),
                path,
                size: meta.len(),
            };
            if format == INDEX_FORMAT {
                files.indexes.push(file);
            } else {
                files.maps.push(file);
            }
        }
        files
    }

    /// Removes every existing output file of `prefix` except the thumbnail.
    /// Returns `(removed_count, bytes_saved)`. Files that vanish between the
    /// listing and the removal are not counted.
    pub fn remove_output_files(&self, prefix: &str) -> Result<(usize, u64), StorageError> {
        let mut removed = 0;
        let mut saved = 0;
        for file in self.output_files(prefix).iter() {
            if remove_if_exists(&file.path)? {
                removed += 1;
                saved += file.size;
            }
        }
        Ok((removed, saved))
    }

    /// Removes every file in the directory whose name starts with `prefix`,
    /// thumbnail and partially written files included. Returns how many
    /// files were removed.
    pub fn purge_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        for entry in self.read_dir()? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            if remove_if_exists(&entry.path())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Lists every eviction candidate: regular files that are neither hidden
    /// nor thumbnails. Files removed while scanning are skipped.
    pub fn list_candidates(&self) -> Result<Vec<StoredFile>, StorageError> {
        let mut files = Vec::new();
        for entry in self.read_dir()? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if is_hidden(&name) || is_thumbnail(&name) {
                continue;
            }
            let path = entry.path();
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Stat { path, source: e }),
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map_err(|e| StorageError::Stat {
                    path: path.clone(),
                    source: e,
                })?;
            files.push(StoredFile {
                name,
                path,
                size: meta.len(),
                modified,
            });
        }
        Ok(files)
    }

    fn read_dir(&self) -> Result<Vec<std::fs::DirEntry>, StorageError> {
        let to_err = |e| StorageError::ReadDirectory {
            path: self.directory.clone(),
            source: e,
        };
        std::fs::read_dir(&self.directory)
            .map_err(to_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(to_err)
    }
}
