//! Local storage for downloaded parts
//!
//! Each part streams into `<root>/<bundle id>/<part id>-<file name>`. A new
//! attempt truncates the file: transfers always restart from byte 0.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::queue::JobId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

const MAX_NAME_LEN: usize = 200;

/// Strip path separators and control characters from a file name
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        return "download".to_string();
    }
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

/// Download directory for part files
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn part_path(&self, bundle_id: Option<JobId>, part_id: JobId, name: &str) -> PathBuf {
        let dir = match bundle_id {
            Some(bundle_id) => self.root.join(bundle_id.to_string()),
            None => self.root.join("unbundled"),
        };
        dir.join(format!("{}-{}", part_id, sanitize_file_name(name)))
    }

    /// Whether an earlier attempt left a file behind
    pub async fn has_output(&self, bundle_id: Option<JobId>, part_id: JobId, name: &str) -> bool {
        let path = self.part_path(bundle_id, part_id, name);
        fs::try_exists(&path).await.unwrap_or(false)
    }

    /// Delete the part file of a part no worker holds
    pub async fn remove(&self, bundle_id: Option<JobId>, part_id: JobId, name: &str) -> Result<()> {
        remove_file(self.part_path(bundle_id, part_id, name)).await
    }

    /// Open the part file for a fresh attempt, truncating earlier bytes
    pub async fn create(
        &self,
        bundle_id: Option<JobId>,
        part_id: JobId,
        name: &str,
    ) -> Result<PartFile> {
        let path = self.part_path(bundle_id, part_id, name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Create {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let file = File::create(&path)
            .await
            .map_err(|source| StorageError::Create {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), "Part file created");
        Ok(PartFile {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }
}

/// An open part file
#[derive(Debug)]
pub struct PartFile {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl PartFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.writer
            .write_all(chunk)
            .await
            .map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush and sync; the file stays on disk
    pub async fn close(mut self) -> Result<PathBuf> {
        let path = self.path.clone();
        let map = |source| StorageError::Write {
            path: path.clone(),
            source,
        };

        self.writer.flush().await.map_err(map)?;
        self.writer.get_ref().sync_data().await.map_err(map)?;

        tracing::debug!(path = %self.path.display(), bytes = self.written, "Part file closed");
        Ok(self.path)
    }

    /// Close and delete the file
    pub async fn discard(self) -> Result<()> {
        drop(self.writer);
        remove_file(self.path).await
    }
}

async fn remove_file(path: PathBuf) -> Result<()> {
    match fs::remove_file(&path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Part file removed");
            Ok(())
        }
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StorageError::Remove { path, source }),
    }
}
