//! A locked cache folder: in-construction or complete.
//!
//! A folder is bound to one index row. While in construction, the holder of
//! the lock adds files and a report, then marks completion; only a complete
//! folder may be read. Writing after completion and reading before it are
//! programming errors, not recoverable conditions.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use super::lock::FolderLock;
use super::CacheError;
use crate::exec::ExecutionReport;
use crate::files::{hash_file, place_file};

/// Completeness marker file
const MARKER_FILENAME: &str = ".complete";
/// Manifest of the folder contents
const MANIFEST_FILENAME: &str = "manifest.json";
/// Cached execution report
const REPORT_FILENAME: &str = "report.json";

/// Entry in the folder manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name inside the folder
    pub name: String,

    /// Size in bytes
    pub size: u64,

    /// SHA-256 of the contents
    pub sha256: String,
}

/// Manifest written when a folder is marked complete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderManifest {
    /// When the folder was completed
    pub created_at: DateTime<Utc>,

    /// All cached files (manifest, marker and lock excluded)
    pub entries: Vec<ManifestEntry>,
}

/// Locked handle on one cache folder.
pub struct CacheFolder {
    id: i64,
    dir: PathBuf,
    complete: bool,
    _lock: FolderLock,
}

impl CacheFolder {
    pub(super) fn new(id: i64, dir: PathBuf, lock: FolderLock) -> Self {
        let complete = dir.join(MARKER_FILENAME).exists();
        Self {
            id,
            dir,
            complete,
            _lock: lock,
        }
    }

    /// Numeric id of the backing index row.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Directory of this folder.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Whether the folder holds committed results.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn internal_name(name: &str) -> bool {
        matches!(
            name,
            MARKER_FILENAME | MANIFEST_FILENAME | REPORT_FILENAME | FolderLock::LOCK_FILENAME
        )
    }

    /// Copy a produced file into the folder under its own name.
    pub fn add_file(&self, src: &Path) -> Result<PathBuf, CacheError> {
        if self.complete {
            return Err(CacheError::WriteAfterComplete(self.dir.display().to_string()));
        }
        let name = src
            .file_name()
            .ok_or_else(|| CacheError::Corrupt(format!("not a file: {}", src.display())))?;
        let dest = self.dir.join(name);
        fs::copy(src, &dest)?;
        Ok(dest)
    }

    /// Write bytes into the folder under `name`.
    pub fn write_file(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        if self.complete {
            return Err(CacheError::WriteAfterComplete(self.dir.display().to_string()));
        }
        let dest = self.dir.join(name);
        fs::write(&dest, bytes)?;
        Ok(dest)
    }

    /// Store the execution report alongside the cached files.
    pub fn store_report(&self, report: &ExecutionReport) -> Result<(), CacheError> {
        if self.complete {
            return Err(CacheError::WriteAfterComplete(self.dir.display().to_string()));
        }
        let json = serde_json::to_vec(report)
            .map_err(|e| CacheError::Corrupt(format!("report serialization: {e}")))?;
        fs::write(self.dir.join(REPORT_FILENAME), json)?;
        Ok(())
    }

    /// Load the report of a complete folder.
    pub fn load_report(&self) -> Result<ExecutionReport, CacheError> {
        if !self.complete {
            return Err(CacheError::ReadBeforeComplete(self.dir.display().to_string()));
        }
        let text = fs::read_to_string(self.dir.join(REPORT_FILENAME))?;
        serde_json::from_str(&text)
            .map_err(|e| CacheError::Corrupt(format!("cached report unreadable: {e}")))
    }

    /// Commit the folder: write the manifest, then the completeness marker.
    pub fn mark_complete(&mut self) -> Result<(), CacheError> {
        if self.complete {
            return Err(CacheError::WriteAfterComplete(self.dir.display().to_string()));
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if Self::internal_name(&name) || !entry.file_type()?.is_file() {
                continue;
            }
            entries.push(ManifestEntry {
                size: entry.metadata()?.len(),
                sha256: hash_file(&entry.path())?,
                name,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let manifest = FolderManifest {
            created_at: Utc::now(),
            entries,
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| CacheError::Corrupt(format!("manifest serialization: {e}")))?;
        fs::write(self.dir.join(MANIFEST_FILENAME), json)?;
        // The marker is written last: a folder with files but no marker is
        // still in construction.
        fs::write(self.dir.join(MARKER_FILENAME), b"")?;
        self.complete = true;
        Ok(())
    }

    /// Load the manifest of a complete folder.
    pub fn manifest(&self) -> Result<FolderManifest, CacheError> {
        if !self.complete {
            return Err(CacheError::ReadBeforeComplete(self.dir.display().to_string()));
        }
        let text = fs::read_to_string(self.dir.join(MANIFEST_FILENAME))?;
        serde_json::from_str(&text)
            .map_err(|e| CacheError::Corrupt(format!("manifest unreadable: {e}")))
    }

    /// Symlink cached files matching `globs` into `dest`, returning the
    /// restored paths. Symlinks avoid duplicating large artifacts.
    pub fn restore_into(&self, dest: &Path, globs: &[String]) -> Result<Vec<PathBuf>, CacheError> {
        if !self.complete {
            return Err(CacheError::ReadBeforeComplete(self.dir.display().to_string()));
        }
        let mut builder = GlobSetBuilder::new();
        for glob in globs {
            builder.add(
                Glob::new(glob).map_err(|e| CacheError::Corrupt(format!("bad glob `{glob}`: {e}")))?,
            );
        }
        let set = builder
            .build()
            .map_err(|e| CacheError::Corrupt(format!("glob set: {e}")))?;

        let mut restored = Vec::new();
        for entry in self.manifest()?.entries {
            if !set.is_match(&entry.name) {
                continue;
            }
            let target = dest.join(&entry.name);
            place_file(&self.dir.join(&entry.name), &target)?;
            restored.push(target);
        }
        restored.sort();
        Ok(restored)
    }

    /// Restore one cached file by name into `dest`.
    pub fn restore_file(&self, name: &str, dest: &Path) -> Result<PathBuf, CacheError> {
        if !self.complete {
            return Err(CacheError::ReadBeforeComplete(self.dir.display().to_string()));
        }
        let src = self.dir.join(name);
        if !src.exists() {
            return Err(CacheError::Corrupt(format!(
                "cached file `{name}` missing from {}",
                self.dir.display()
            )));
        }
        let target = dest.join(name);
        place_file(&src, &target)?;
        Ok(target)
    }

    /// Wipe the folder back to the in-construction state.
    ///
    /// The marker goes first, then the contents; both happen under the
    /// exclusive lock this handle holds, so no other caller can observe the
    /// intermediate state.
    pub(super) fn invalidate(&mut self) -> Result<(), CacheError> {
        let marker = self.dir.join(MARKER_FILENAME);
        if marker.exists() {
            fs::remove_file(&marker)?;
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == FolderLock::LOCK_FILENAME {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        self.complete = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecutionReport;
    use crate::limits::ExecutionLimits;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_folder(dir: &Path) -> CacheFolder {
        let lock = FolderLock::acquire(dir, Duration::from_secs(1)).unwrap();
        CacheFolder::new(7, dir.to_path_buf(), lock)
    }

    fn sample_report() -> ExecutionReport {
        ExecutionReport::synthetic(&ExecutionLimits::default(), "true")
    }

    #[test]
    fn populate_then_complete_then_restore() {
        let temp = TempDir::new().unwrap();
        let folder_dir = temp.path().join("7");
        let work = temp.path().join("work");
        fs::create_dir(&work).unwrap();

        let mut folder = open_folder(&folder_dir);
        assert!(!folder.is_complete());

        folder.write_file("test.out", b"42\n").unwrap();
        folder.store_report(&sample_report()).unwrap();
        folder.mark_complete().unwrap();
        assert!(folder.is_complete());

        let restored = folder.restore_into(&work, &["*.out".to_string()]).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(fs::read_to_string(&restored[0]).unwrap(), "42\n");

        let report = folder.load_report().unwrap();
        assert_eq!(report.exit_code, 0);
    }

    #[test]
    fn write_after_complete_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut folder = open_folder(&temp.path().join("7"));
        folder.mark_complete().unwrap();

        assert!(matches!(
            folder.write_file("late.txt", b"x"),
            Err(CacheError::WriteAfterComplete(_))
        ));
        assert!(matches!(
            folder.store_report(&sample_report()),
            Err(CacheError::WriteAfterComplete(_))
        ));
        assert!(matches!(
            folder.mark_complete(),
            Err(CacheError::WriteAfterComplete(_))
        ));
    }

    #[test]
    fn read_before_complete_is_rejected() {
        let temp = TempDir::new().unwrap();
        let folder = open_folder(&temp.path().join("7"));

        assert!(matches!(
            folder.load_report(),
            Err(CacheError::ReadBeforeComplete(_))
        ));
        assert!(matches!(
            folder.restore_into(temp.path(), &[]),
            Err(CacheError::ReadBeforeComplete(_))
        ));
    }

    #[test]
    fn manifest_skips_internal_files() {
        let temp = TempDir::new().unwrap();
        let mut folder = open_folder(&temp.path().join("7"));
        folder.write_file("a.out", b"a").unwrap();
        folder.store_report(&sample_report()).unwrap();
        folder.mark_complete().unwrap();

        let manifest = folder.manifest().unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].name, "a.out");
    }

    #[test]
    fn invalidate_resets_to_in_construction() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("7");
        let mut folder = open_folder(&dir);
        folder.write_file("a.out", b"a").unwrap();
        folder.mark_complete().unwrap();

        folder.invalidate().unwrap();
        assert!(!folder.is_complete());
        assert!(!dir.join("a.out").exists());
        assert!(!dir.join(MARKER_FILENAME).exists());
        // Lock file survives the wipe
        assert!(dir.join(FolderLock::LOCK_FILENAME).exists());
    }
}
