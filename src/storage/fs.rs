//! Directory-backed storage: `<root>/<table id>/<file name>`.
//!
//! Incoming files are written next to their final path with a
//! `.stream.tmp` suffix and renamed into place on commit, so a reader of the
//! table directory never sees a half-received file.

use super::StreamStorage;
use crate::error::{Result, StreamError};
use crate::streaming::types::{FileDescriptor, TableId};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

const PARTIAL_SUFFIX: &str = "stream.tmp";

/// Validate that a peer-supplied file name stays inside `root`.
fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(StreamError::storage("Empty file name not allowed"));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(StreamError::storage(format!(
            "Absolute paths not allowed: {}",
            relative
        )));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(StreamError::storage(format!(
                    "Path traversal not allowed: {}",
                    relative
                )));
            }
            Component::Prefix(_) => {
                return Err(StreamError::storage(format!(
                    "Windows prefix paths not allowed: {}",
                    relative
                )));
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(StreamError::storage(format!(
            "Path escapes table directory: {}",
            relative
        )));
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_dir(&self, table: TableId) -> PathBuf {
        self.root.join(table.to_string())
    }

    fn final_path(&self, file: &FileDescriptor) -> Result<PathBuf> {
        validate_path(&self.table_dir(file.table_id), &file.name)
    }

    fn partial_path(&self, file: &FileDescriptor) -> Result<PathBuf> {
        let full = self.final_path(file)?;
        let mut name = full
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| StreamError::storage(format!("Invalid file name: {}", file.name)))?;
        name.push(".");
        name.push(PARTIAL_SUFFIX);
        Ok(full.with_file_name(name))
    }
}

#[async_trait]
impl StreamStorage for FsStorage {
    async fn list_files(&self, table: TableId) -> Result<Vec<FileDescriptor>> {
        let dir = self.table_dir(table);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            files.push(FileDescriptor::new(table, name, meta.len()));
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn read_chunk(&self, file: &FileDescriptor, offset: u64, len: usize) -> Result<Bytes> {
        let path = self.final_path(file)?;
        let mut f = fs::File::open(&path).await.map_err(|e| {
            StreamError::storage(format!("Failed to open {}: {}", path.display(), e))
        })?;
        f.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len);
        f.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_chunk(&self, file: &FileDescriptor, offset: u64, data: Bytes) -> Result<()> {
        let temp_path = self.partial_path(file)?;
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&temp_path)
            .await?;
        f.seek(SeekFrom::Start(offset)).await?;
        f.write_all(&data).await?;
        f.flush().await?;
        Ok(())
    }

    async fn commit_file(&self, file: &FileDescriptor) -> Result<()> {
        let temp_path = self.partial_path(file)?;
        let full_path = self.final_path(file)?;

        match OpenOptions::new().write(true).open(&temp_path).await {
            Ok(f) => f.sync_all().await?,
            // Zero-length files never had a chunk written
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = temp_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::File::create(&temp_path).await?;
            }
            Err(e) => return Err(e.into()),
        }

        fs::rename(&temp_path, &full_path).await?;
        Ok(())
    }

    async fn discard_partial(&self, file: &FileDescriptor) -> Result<()> {
        let temp_path = self.partial_path(file)?;
        match fs::remove_file(&temp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::warn!(
                    "Failed to discard partial file {}: {}",
                    temp_path.display(),
                    e
                );
                Err(e.into())
            }
        }
    }
}
