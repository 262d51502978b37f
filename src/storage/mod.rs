//! Storage seam used by sessions.
//!
//! The streaming core never interprets file contents. It asks storage which
//! files make up a table range, reads them in chunks on the sending side and
//! writes chunks on the receiving side. Partially received files are either
//! committed or handed back for discard.

use crate::error::Result;
use crate::streaming::types::{FileDescriptor, StreamSummary, TableId};
use async_trait::async_trait;
use bytes::Bytes;

pub mod fs;
pub mod memory;

pub use self::fs::FsStorage;
pub use self::memory::MemoryStorage;

#[async_trait]
pub trait StreamStorage: Send + Sync {
    /// Files that make up the streamable range of `table`.
    async fn list_files(&self, table: TableId) -> Result<Vec<FileDescriptor>>;

    /// Summary of what streaming `table` would move.
    async fn enumerate_ranges(&self, table: TableId) -> Result<StreamSummary> {
        let files = self.list_files(table).await?;
        Ok(StreamSummary::of_files(table, &files))
    }

    /// Read at most `len` bytes of `file` starting at `offset`.
    async fn read_chunk(&self, file: &FileDescriptor, offset: u64, len: usize) -> Result<Bytes>;

    /// Write received bytes of a file that is still being transferred.
    async fn write_chunk(&self, file: &FileDescriptor, offset: u64, data: Bytes) -> Result<()>;

    /// Make a fully received file visible.
    async fn commit_file(&self, file: &FileDescriptor) -> Result<()>;

    /// Drop whatever was received of an unfinished file.
    async fn discard_partial(&self, file: &FileDescriptor) -> Result<()>;
}
