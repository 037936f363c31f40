//! Virtual filesystem: disk reads shadowed by open editor buffers.
//!
//! The language server holds the authoritative content of files the user is
//! editing; everything else lives on disk. Reads go through this module so
//! callers never have to care which side the bytes come from. Directory
//! listings and open-file queries drive scheduling priority, so they are
//! cheap and lock-free on the buffer side.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use tracing::trace;

use crate::{
    error::{EngineError, Result},
    path::clean,
};

/// An open editor buffer.
#[derive(Clone, Debug)]
pub struct Document {
    text: Arc<str>,
    version: i32,
}

impl Document {
    pub fn new(text: impl Into<Arc<str>>, version: i32) -> Self {
        Self {
            text: text.into(),
            version,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> i32 {
        self.version
    }
}

/// A single directory entry as reported by [`Filesystem::read_dir`].
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Unified view of on-disk files and in-memory editor buffers.
///
/// Cheaply cloneable; clones share the same buffer store.
#[derive(Clone, Default)]
pub struct Filesystem {
    open_docs: Arc<DashMap<PathBuf, Document>>,
}

impl Filesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly opened editor buffer for `path`.
    pub fn open_document(&self, path: impl AsRef<Path>, text: impl Into<Arc<str>>, version: i32) {
        let path = clean(path.as_ref());
        trace!(path = %path.display(), version, "open document");
        self.open_docs.insert(path, Document::new(text, version));
    }

    /// Replace the content of an open buffer. Opens it if it was not open.
    pub fn change_document(&self, path: impl AsRef<Path>, text: impl Into<Arc<str>>, version: i32) {
        let path = clean(path.as_ref());
        trace!(path = %path.display(), version, "change document");
        self.open_docs.insert(path, Document::new(text, version));
    }

    /// Drop the buffer for `path`; subsequent reads fall through to disk.
    pub fn close_document(&self, path: impl AsRef<Path>) {
        let path = clean(path.as_ref());
        trace!(path = %path.display(), "close document");
        self.open_docs.remove(&path);
    }

    /// The open buffer for `path`, if any.
    pub fn document(&self, path: impl AsRef<Path>) -> Option<Document> {
        self.open_docs.get(&clean(path.as_ref())).map(|d| d.clone())
    }

    /// Whether any open buffer lives under `dir` (recursively).
    pub fn has_open_files(&self, dir: impl AsRef<Path>) -> bool {
        let dir = clean(dir.as_ref());
        self.open_docs.iter().any(|entry| entry.key().starts_with(&dir))
    }

    /// Read the content of `path`. An open buffer shadows the on-disk bytes.
    pub async fn read_file(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = clean(path.as_ref());
        if let Some(doc) = self.open_docs.get(&path) {
            return Ok(doc.text().as_bytes().to_vec());
        }
        tokio::fs::read(&path)
            .await
            .map_err(|err| EngineError::io(&path, err))
    }

    /// List the entries of the directory at `path`, merging in open buffers
    /// that are direct children but not (yet) present on disk.
    pub async fn read_dir(&self, path: impl AsRef<Path>) -> Result<Vec<DirEntry>> {
        let path = clean(path.as_ref());
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|err| EngineError::io(&path, err))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| EngineError::io(&path, err))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let is_dir = entry
                .file_type()
                .await
                .map(|ty| ty.is_dir())
                .unwrap_or(false);
            entries.push(DirEntry { name, is_dir });
        }

        for doc in self.open_docs.iter() {
            let buffered = doc.key();
            if buffered.parent() != Some(path.as_path()) {
                continue;
            }
            let Some(name) = buffered.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !entries.iter().any(|e| e.name == name) {
                entries.push(DirEntry {
                    name: name.to_string(),
                    is_dir: false,
                });
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Metadata probe for `path`. Open buffers count as existing files.
    pub async fn metadata(&self, path: impl AsRef<Path>) -> Result<FileKind> {
        let path = clean(path.as_ref());
        if self.open_docs.contains_key(&path) {
            return Ok(FileKind::File);
        }
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|err| EngineError::io(&path, err))?;
        Ok(if meta.is_dir() {
            FileKind::Dir
        } else {
            FileKind::File
        })
    }

    /// Whether a file or directory exists at `path`.
    pub async fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.metadata(path).await.is_ok()
    }
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("open_docs", &self.open_docs.len())
            .finish()
    }
}

/// Kind of filesystem object found by [`Filesystem::metadata`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FileKind {
    File,
    Dir,
}
