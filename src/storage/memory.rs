//! Heap-backed storage, used by the simulator and tests.

use super::StreamStorage;
use crate::error::{Result, StreamError};
use crate::streaming::types::{FileDescriptor, TableId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    committed: HashMap<TableId, BTreeMap<String, Bytes>>,
    partial: HashMap<(TableId, String), Vec<u8>>,
    discarded: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_file(&self, table: TableId, name: impl Into<String>, data: impl Into<Bytes>) {
        self.lock()
            .committed
            .entry(table)
            .or_default()
            .insert(name.into(), data.into());
    }

    pub fn file(&self, table: TableId, name: &str) -> Option<Bytes> {
        self.lock()
            .committed
            .get(&table)
            .and_then(|files| files.get(name).cloned())
    }

    /// Names of files currently being received.
    pub fn partial_files(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().partial.keys().map(|(_, n)| n.clone()).collect();
        names.sort();
        names
    }

    /// Names of files that were discarded after a failed or aborted transfer.
    pub fn discarded_files(&self) -> Vec<String> {
        self.lock().discarded.clone()
    }
}

#[async_trait]
impl StreamStorage for MemoryStorage {
    async fn list_files(&self, table: TableId) -> Result<Vec<FileDescriptor>> {
        Ok(self
            .lock()
            .committed
            .get(&table)
            .map(|files| {
                files
                    .iter()
                    .map(|(name, data)| FileDescriptor::new(table, name.clone(), data.len() as u64))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_chunk(&self, file: &FileDescriptor, offset: u64, len: usize) -> Result<Bytes> {
        let data = self
            .file(file.table_id, &file.name)
            .ok_or_else(|| StreamError::storage(format!("no such file: {}", file.name)))?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn write_chunk(&self, file: &FileDescriptor, offset: u64, data: Bytes) -> Result<()> {
        let mut tables = self.lock();
        let buf = tables
            .partial
            .entry((file.table_id, file.name.clone()))
            .or_default();
        let start = offset as usize;
        let end = start + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(&data);
        Ok(())
    }

    async fn commit_file(&self, file: &FileDescriptor) -> Result<()> {
        let mut tables = self.lock();
        let data = tables
            .partial
            .remove(&(file.table_id, file.name.clone()))
            .unwrap_or_default();
        tables
            .committed
            .entry(file.table_id)
            .or_default()
            .insert(file.name.clone(), Bytes::from(data));
        Ok(())
    }

    async fn discard_partial(&self, file: &FileDescriptor) -> Result<()> {
        let mut tables = self.lock();
        tables.partial.remove(&(file.table_id, file.name.clone()));
        tables.discarded.push(file.name.clone());
        Ok(())
    }
}
