//! A content-addressed on-disk store for fetched workflows.
//!
//! Layout, under a base directory:
//!
//! ```text
//! <store>/index.json        {"<canonical-ref>": {"hex": ..., "retrieved-at": ...}, ...}
//! <store>/<hex>             raw bytes, one file per content digest
//! ```
//!
//! Mutations go through `&mut self` and land on disk via tempfile +
//! atomic rename, so readers holding open files are never corrupted;
//! [`Store::gc`] only unlinks.

use std::fs::{self, File};
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const INDEX_FILE: &str = "index.json";

/// Errors produced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O failure against the store directory.
    #[error("store I/O error")]
    Io(#[from] std::io::Error),

    /// The index file exists but can't be read as JSON.
    #[error("corrupt store index")]
    Index(#[from] serde_json::Error),
}

/// One stored entry: the digest of the content plus when it was fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Entry {
    /// Hex-encoded SHA-256 of the stored bytes; also the on-disk filename.
    pub hex: String,
    /// When the content was fetched.
    pub retrieved_at: DateTime<Utc>,
}

/// A content-addressed store rooted at a directory.
#[derive(Debug)]
pub struct Store {
    root: Utf8PathBuf,
    index: IndexMap<String, Entry>,
}

impl Store {
    /// Opens (creating if needed) a store at `root`. A missing index is
    /// treated as an empty store.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let index = match fs::read(root.join(INDEX_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { root, index })
    }

    /// The directory this store lives in.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Stores `bytes` under the given canonical reference, overwriting any
    /// previous entry for it. The index is persisted before returning.
    pub fn put(&mut self, id: &str, bytes: &[u8]) -> Result<Entry, StoreError> {
        let hex = format!("{:x}", Sha256::digest(bytes));
        let path = self.root.join(&hex);

        if !path.exists() {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
            tmp.write_all(bytes)?;
            tmp.persist(&path).map_err(|e| e.error)?;
        }

        let entry = Entry {
            hex,
            retrieved_at: Utc::now(),
        };
        self.index.insert(id.to_string(), entry.clone());
        self.persist()?;

        Ok(entry)
    }

    /// Returns an open handle to the content stored for `id`, or `None`
    /// when the reference is unknown (or its content was collected).
    pub fn get(&self, id: &str) -> Result<Option<File>, StoreError> {
        let Some(entry) = self.index.get(id) else {
            return Ok(None);
        };

        match File::open(self.root.join(&entry.hex)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Convenience wrapper over [`Store::get`] reading the content fully.
    pub fn read(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(entry) = self.index.get(id) else {
            return Ok(None);
        };

        match fs::read(self.root.join(&entry.hex)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the store has content for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.index
            .get(id)
            .is_some_and(|entry| self.root.join(&entry.hex).exists())
    }

    /// All known entries, oldest retrieval first.
    pub fn list(&self) -> Vec<(&str, &Entry)> {
        let mut entries: Vec<(&str, &Entry)> = self
            .index
            .iter()
            .map(|(id, entry)| (id.as_str(), entry))
            .collect();
        entries.sort_by_key(|(_, entry)| entry.retrieved_at);
        entries
    }

    /// Removes content files with no index entry and index entries with no
    /// content file. Returns how many of each were dropped.
    pub fn gc(&mut self) -> Result<usize, StoreError> {
        let mut removed = 0;

        let before = self.index.len();
        let root = self.root.clone();
        self.index.retain(|_, entry| root.join(&entry.hex).exists());
        removed += before - self.index.len();

        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == INDEX_FILE {
                continue;
            }
            if !self.index.values().any(|entry| entry.hex == name) {
                fs::remove_file(dirent.path())?;
                removed += 1;
            }
        }

        self.persist()?;
        Ok(removed)
    }

    /// Drops every entry and content file.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.index.clear();
        self.gc()?;
        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        serde_json::to_writer_pretty(&mut tmp, &self.index)?;
        tmp.persist(self.root.join(INDEX_FILE)).map_err(|e| e.error)?;
        Ok(())
    }
}
