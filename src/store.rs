//! External collaborator seams.
//!
//! The aggregate store owns file rows; the search core reads them through
//! [`FileStore`] and writes back only via `confirm_indexed`. [`Clock`]
//! abstracts wall-clock time for deterministic tests. [`TextExtractor`]
//! is the MIME-specific extraction seam; unknown MIME types produce `None`.
//!
//! [`MemoryFileStore`] is a reference implementation used by the test
//! suites and by embedders that keep their aggregate in memory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::{FileDocument, FileId, SearchIndexState};

/// Read access to the authoritative file aggregate, plus the single
/// write-back the search core is allowed.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn get(&self, id: FileId) -> Result<Option<FileDocument>>;

    /// Records a successful projection commit on the aggregate.
    async fn confirm_indexed(&self, id: FileId, state: SearchIndexState) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn utc_now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// MIME-specific text extraction. The core treats unknown MIME types as
/// producing no text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], mime: &str) -> Option<String>;
}

/// Extractor that knows no formats. Useful when metadata text is supplied
/// by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullExtractor;

impl TextExtractor for NullExtractor {
    fn extract(&self, _bytes: &[u8], _mime: &str) -> Option<String> {
        None
    }
}

/// In-memory file aggregate.
#[derive(Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<FileId, FileDocument>>,
}

impl MemoryFileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, file: FileDocument) {
        self.files.write().await.insert(file.id, file);
    }

    pub async fn remove(&self, id: FileId) -> Option<FileDocument> {
        self.files.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn get(&self, id: FileId) -> Result<Option<FileDocument>> {
        Ok(self.files.read().await.get(&id).cloned())
    }

    async fn confirm_indexed(&self, id: FileId, state: SearchIndexState) -> Result<()> {
        if let Some(file) = self.files.write().await.get_mut(&id) {
            file.search_index_state = Some(state);
        }
        Ok(())
    }
}
