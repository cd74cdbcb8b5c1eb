//! Content-addressed cache for compile and execution results.
//!
//! A [`CacheKey`] is a deterministic fingerprint of a unit of work: a
//! cache-type tag, the serialized limits, the sorted identities of the
//! program's files, and the sorted identities of its input files. The
//! SQLite index maps each key to a stable numeric folder id; the folder
//! holds the produced files plus the execution report. Equality depends on
//! content hashes, never on paths or timestamps, so a stale hash-list
//! forces invalidation before reuse.

mod folder;
mod index;
mod lock;

pub use folder::{CacheFolder, FolderManifest, ManifestEntry};
pub use index::{CacheIndex, IndexEntry};
pub use lock::{FolderLock, LockError};

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::error::GraderResult;
use crate::files::{hash_file, sha256_hex, FileDescriptor, FileSource};
use crate::limits::ExecutionLimits;

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Retryable: the caller may resubmit the identical request later.
    #[error("cache lock timeout after {0:?} (retryable)")]
    LockTimeout(Duration),

    #[error("cache index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("write to completed cache folder {0}")]
    WriteAfterComplete(String),

    #[error("read from in-construction cache folder {0}")]
    ReadBeforeComplete(String),

    #[error("cache corruption: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::LockTimeout(_))
    }
}

impl From<LockError> for CacheError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout(d) => CacheError::LockTimeout(d),
            LockError::Io(e) => CacheError::Io(e),
        }
    }
}

/// Deterministic fingerprint of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    files_id: String,
    hash_list: Vec<String>,
}

impl CacheKey {
    /// The index key string.
    pub fn files_id(&self) -> &str {
        &self.files_id
    }

    /// Sorted content hashes, joined for storage in the index.
    pub fn hash_list_string(&self) -> String {
        self.hash_list.join(";")
    }
}

/// Accumulates file and input identities into a [`CacheKey`].
///
/// Identities follow the original scheme: `file:{name}:{hash}` for inline
/// content, `path:{path}` for path references, `dep:{name}` for resolved
/// dependencies, `input:{basename}` for input files. The content hash of
/// every file lands in the hash list regardless of identity kind.
pub struct CacheKeyBuilder {
    tag: String,
    limits_token: String,
    file_ids: Vec<String>,
    input_ids: Vec<String>,
    hashes: Vec<String>,
}

impl CacheKeyBuilder {
    /// Start a key for a cache-type tag such as `compile:checker` or
    /// `execute:solution:arg1 arg2`.
    pub fn new(tag: &str, limits: &ExecutionLimits) -> Self {
        Self {
            tag: tag.to_string(),
            limits_token: limits.cache_token(),
            file_ids: Vec::new(),
            input_ids: Vec::new(),
            hashes: Vec::new(),
        }
    }

    /// Add a declared file. `resolved` is the on-disk path the descriptor
    /// resolved to (required for path and dependency descriptors).
    pub fn file(&mut self, descr: &FileDescriptor, resolved: Option<&Path>) -> GraderResult<&mut Self> {
        match descr.source()? {
            FileSource::Content(content) => {
                let hash = sha256_hex(content.as_bytes());
                self.file_ids.push(format!("file:{}:{}", descr.name, hash));
                self.hashes.push(hash);
            }
            FileSource::Path(path) => {
                let resolved = resolved.ok_or_else(|| {
                    crate::error::GraderError::MissingFile(path.to_string())
                })?;
                self.file_ids.push(format!("path:{path}"));
                self.hashes.push(hash_file(resolved)?);
            }
            FileSource::Dependency => {
                let resolved = resolved.ok_or_else(|| {
                    crate::error::GraderError::MissingFile(descr.name.clone())
                })?;
                self.file_ids.push(format!("dep:{}", descr.name));
                self.hashes.push(hash_file(resolved)?);
            }
        }
        Ok(self)
    }

    /// Add an input file (test input, stdin file).
    pub fn input(&mut self, path: &Path) -> GraderResult<&mut Self> {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.input_ids.push(format!("input:{basename}"));
        self.hashes.push(hash_file(path)?);
        Ok(self)
    }

    /// Finish the key: identities and hashes are sorted so declaration
    /// order never affects cache equality.
    pub fn finish(mut self) -> CacheKey {
        self.file_ids.sort();
        self.input_ids.sort();
        self.hashes.sort();
        let files_id = format!(
            "cache:{};limits:{};{};{}",
            self.tag,
            self.limits_token,
            self.file_ids.join(";"),
            self.input_ids.join(";")
        );
        CacheKey {
            files_id,
            hash_list: self.hashes,
        }
    }
}

/// The content-addressed cache: index plus folder tree.
pub struct Cache {
    root: PathBuf,
    db_path: PathBuf,
    lock_timeout: Duration,
}

impl Cache {
    pub fn new(root: &Path, db_path: &Path, lock_timeout: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            db_path: db_path.to_path_buf(),
            lock_timeout,
        }
    }

    /// Map a key to its locked folder.
    ///
    /// The returned handle is either complete (hash-list matched and the
    /// folder was committed) or empty and ready to populate. A hash-list
    /// mismatch updates the index row and wipes the folder before the
    /// handle is returned; both happen under the folder's exclusive lock.
    pub fn get_folder(&self, key: &CacheKey) -> Result<CacheFolder, CacheError> {
        let index = CacheIndex::open(&self.db_path)?;
        let hash_list = key.hash_list_string();

        // The first lookup only pins the folder id; the row may still move
        // while we wait for the lock.
        let id = match index.lookup(key.files_id())? {
            Some(entry) => entry.id,
            None => index.insert(key.files_id(), &hash_list)?,
        };

        let dir = self.root.join(id.to_string());
        let lock = FolderLock::acquire(&dir, self.lock_timeout)?;
        let mut folder = CacheFolder::new(id, dir, lock);

        // Re-read the row now that the folder is exclusively ours: a commit
        // that finished while we waited must be compared against, not the
        // stale pre-lock snapshot.
        let stored = index
            .lookup(key.files_id())?
            .ok_or_else(|| {
                CacheError::Corrupt(format!("index row vanished for key `{}`", key.files_id()))
            })?
            .hash_list;

        if stored == hash_list {
            debug!(id, complete = folder.is_complete(), "cache folder reused");
        } else {
            // Contents changed behind the same identities: refresh the
            // row and drop the stale folder contents.
            debug!(id, "cache hash-list mismatch, invalidating folder");
            index.update_hash_list(id, &hash_list)?;
            folder.invalidate()?;
        }

        Ok(folder)
    }
}
