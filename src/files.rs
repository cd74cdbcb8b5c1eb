//! File descriptors, content hashing, captures, and the path allow-list.
//!
//! A [`FileDescriptor`] names a file and exactly one way to obtain it:
//! inline content, a path, or resolution as a build dependency. Cache
//! identity is derived from content hashes (inline/path) or the name
//! (dependency), never from timestamps.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GraderError, GraderResult};

/// A file used by a program: sources, dependencies, extra tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Name of the file inside the working directory
    pub name: String,

    /// Inline content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Path relative to the root/task directories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Resolve through the language's dependency search rules
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dependency: bool,
}

/// How a descriptor's content is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSource<'a> {
    Content(&'a str),
    Path(&'a str),
    Dependency,
}

impl FileDescriptor {
    /// Descriptor carrying inline content.
    pub fn inline(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            content: Some(content.to_string()),
            path: None,
            dependency: false,
        }
    }

    /// Descriptor referencing a path.
    pub fn at_path(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            content: None,
            path: Some(path.to_string()),
            dependency: false,
        }
    }

    /// Descriptor resolved as a build dependency.
    pub fn dependency(name: &str) -> Self {
        Self {
            name: name.to_string(),
            content: None,
            path: None,
            dependency: true,
        }
    }

    /// The single declared source, rejecting descriptors with zero or
    /// several of content/path/dependency.
    pub fn source(&self) -> GraderResult<FileSource<'_>> {
        match (&self.content, &self.path, self.dependency) {
            (Some(content), None, false) => Ok(FileSource::Content(content)),
            (None, Some(path), false) => Ok(FileSource::Path(path)),
            (None, None, true) => Ok(FileSource::Dependency),
            _ => Err(GraderError::Input(format!(
                "file `{}` must declare exactly one of content, path or dependency",
                self.name
            ))),
        }
    }
}

/// SHA-256 of a byte slice, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file's contents, hex-encoded. Streams to keep memory flat
/// on large test files.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Allow-list of path roots that path-based file references may resolve
/// into. An empty list means unrestricted.
#[derive(Debug, Clone, Default)]
pub struct PathAllowList {
    roots: Vec<PathBuf>,
}

impl PathAllowList {
    /// Build an allow-list from canonicalized roots; roots that do not
    /// exist are dropped (they can never contain a real file anyway).
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let roots = roots
            .into_iter()
            .filter_map(|p| fs::canonicalize(p.as_ref()).ok())
            .collect();
        Self { roots }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.roots.is_empty()
    }

    /// Canonicalize `path` and verify it falls under one of the allowed
    /// roots. The canonicalization defeats `..` traversal and symlink
    /// escapes in attacker-supplied references.
    pub fn check(&self, path: &Path) -> GraderResult<PathBuf> {
        let resolved = fs::canonicalize(path)
            .map_err(|_| GraderError::MissingFile(path.display().to_string()))?;
        if self.roots.is_empty() || self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(GraderError::PathRestriction(path.display().to_string()))
        }
    }
}

/// Fetch a descriptor's content into `dest_dir` and return the resulting
/// path. Inline content is written out; path references are checked against
/// the allow-list and symlinked. Dependencies are resolved by the caller
/// (the language knows the search rules) and fetched via [`place_file`].
pub fn fetch_file(
    descr: &FileDescriptor,
    dest_dir: &Path,
    allow: &PathAllowList,
) -> GraderResult<PathBuf> {
    let dest = dest_dir.join(&descr.name);
    match descr.source()? {
        FileSource::Content(content) => {
            fs::write(&dest, content)?;
        }
        FileSource::Path(path) => {
            let resolved = allow.check(Path::new(path))?;
            place_file(&resolved, &dest)?;
        }
        FileSource::Dependency => {
            return Err(GraderError::Input(format!(
                "dependency `{}` must be resolved before fetching",
                descr.name
            )));
        }
    }
    Ok(dest)
}

/// Link `src` at `dest`, replacing any previous entry. Symlinks keep large
/// artifacts from being duplicated; non-unix targets fall back to a copy.
pub fn place_file(src: &Path, dest: &Path) -> io::Result<()> {
    if dest.symlink_metadata().is_ok() {
        fs::remove_file(dest)?;
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(src, dest)
    }
    #[cfg(not(unix))]
    {
        fs::copy(src, dest).map(|_| ())
    }
}

/// A captured output stream or file, as embedded in reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    /// Logical name ("stdout", "stderr", or the file name)
    pub name: String,

    /// Size of the full file on disk, in kilobytes
    pub size_kb: u64,

    /// Captured data, possibly truncated. Reports are JSON, so the bytes
    /// are decoded as UTF-8 with invalid sequences replaced by U+FFFD;
    /// binary output is therefore not reproduced byte-for-byte here (the
    /// file on disk stays intact).
    pub data: String,

    /// Whether `data` was cut short by the truncate size
    pub was_truncated: bool,
}

impl Capture {
    /// An empty capture for synthesized reports.
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size_kb: 0,
            data: String::new(),
            was_truncated: false,
        }
    }
}

/// Capture a file for inclusion in a report. `truncate_kb < 0` captures the
/// whole file; otherwise at most `truncate_kb` kilobytes are kept and the
/// truncation is flagged. Non-UTF-8 bytes are replaced, see [`Capture::data`].
pub fn capture_file(path: &Path, name: &str, truncate_kb: i64) -> io::Result<Capture> {
    let size = fs::metadata(path)?.len();
    let mut file = fs::File::open(path)?;
    let (data, was_truncated) = if truncate_kb < 0 {
        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)?;
        (data, false)
    } else {
        let limit = truncate_kb as u64 * 1024;
        let mut data = vec![0u8; limit.min(size) as usize];
        file.read_exact(&mut data)?;
        (data, size > limit)
    };
    Ok(Capture {
        name: name.to_string(),
        size_kb: size / 1024,
        data: String::from_utf8_lossy(&data).into_owned(),
        was_truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn descriptor_requires_exactly_one_source() {
        assert!(FileDescriptor::inline("a.c", "int main(){}").source().is_ok());
        assert!(FileDescriptor::at_path("a.c", "/task/a.c").source().is_ok());
        assert!(FileDescriptor::dependency("lib.h").source().is_ok());

        let both = FileDescriptor {
            name: "a.c".into(),
            content: Some("x".into()),
            path: Some("/task/a.c".into()),
            dependency: false,
        };
        assert!(both.source().is_err());

        let none = FileDescriptor {
            name: "a.c".into(),
            content: None,
            path: None,
            dependency: false,
        };
        assert!(none.source().is_err());
    }

    #[test]
    fn hashing_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "same").unwrap();
        fs::write(&b, "same").unwrap();
        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
        assert_eq!(hash_file(&a).unwrap(), sha256_hex(b"same"));

        fs::write(&b, "different").unwrap();
        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn allow_list_blocks_escapes() {
        let dir = TempDir::new().unwrap();
        let inside = dir.path().join("inside.txt");
        fs::write(&inside, "ok").unwrap();

        let other = TempDir::new().unwrap();
        let outside = other.path().join("outside.txt");
        fs::write(&outside, "no").unwrap();

        let allow = PathAllowList::new([dir.path()]);
        assert!(allow.check(&inside).is_ok());
        assert!(matches!(
            allow.check(&outside),
            Err(GraderError::PathRestriction(_))
        ));

        // Traversal through the allowed root is also rejected
        let sneaky = dir.path().join("..").join(
            outside
                .parent()
                .unwrap()
                .file_name()
                .unwrap(),
        );
        let sneaky = sneaky.join("outside.txt");
        assert!(allow.check(&sneaky).is_err());
    }

    #[test]
    fn empty_allow_list_is_unrestricted() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f.txt");
        fs::write(&file, "x").unwrap();
        let allow = PathAllowList::default();
        assert!(allow.is_unrestricted());
        assert!(allow.check(&file).is_ok());
    }

    #[test]
    fn fetch_inline_and_path() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();

        let inline = FileDescriptor::inline("main.c", "int main(){return 0;}");
        let written = fetch_file(&inline, &work, &PathAllowList::default()).unwrap();
        assert_eq!(fs::read_to_string(written).unwrap(), "int main(){return 0;}");

        let src = dir.path().join("lib.h");
        fs::write(&src, "#define X 1").unwrap();
        let by_path = FileDescriptor::at_path("lib.h", src.to_str().unwrap());
        let linked = fetch_file(&by_path, &work, &PathAllowList::default()).unwrap();
        assert_eq!(fs::read_to_string(linked).unwrap(), "#define X 1");
    }

    #[test]
    fn capture_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.out");
        fs::write(&path, vec![b'x'; 3000]).unwrap();

        let full = capture_file(&path, "stdout", -1).unwrap();
        assert_eq!(full.data.len(), 3000);
        assert!(!full.was_truncated);

        let cut = capture_file(&path, "stdout", 2).unwrap();
        assert_eq!(cut.data.len(), 2048);
        assert!(cut.was_truncated);
        assert_eq!(cut.size_kb, 2);
    }

    #[test]
    fn capture_replaces_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binary.out");
        fs::write(&path, b"ok\xff\xfeok").unwrap();

        let capture = capture_file(&path, "stdout", -1).unwrap();
        assert_eq!(capture.data, "ok\u{fffd}\u{fffd}ok");
        // The on-disk file keeps the original bytes
        assert_eq!(fs::read(&path).unwrap(), b"ok\xff\xfeok");
    }
}
