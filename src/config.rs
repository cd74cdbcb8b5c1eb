//! Grader configuration.
//!
//! Built-in defaults overlaid by an optional TOML file. Everything here is
//! host configuration: directory layout, external binaries, limit maxima,
//! the cache lock timeout, and per-language limit transforms.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lang::Language;

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Per-language transform applied to requested limits before enforcement.
///
/// Memory is a one-way transform (`offset + scale * limit`). Time is a
/// forward/inverse pair (`limit * scale` forward); measured times are
/// un-transformed back to task units before reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitTransform {
    /// Fixed memory overhead added to the limit, in kilobytes
    pub memory_offset_kb: u64,

    /// Multiplier applied to the memory limit
    pub memory_scale: f64,

    /// Multiplier applied to the time limit
    pub time_scale: f64,
}

impl Default for LimitTransform {
    fn default() -> Self {
        Self {
            memory_offset_kb: 0,
            memory_scale: 1.0,
            time_scale: 1.0,
        }
    }
}

impl LimitTransform {
    /// Transform a requested memory limit into the enforced limit.
    pub fn transform_memory(&self, limit_kb: u64) -> u64 {
        self.memory_offset_kb + (limit_kb as f64 * self.memory_scale).round() as u64
    }

    /// Transform a requested time limit into the enforced limit.
    pub fn transform_time(&self, limit_ms: u64) -> u64 {
        (limit_ms as f64 * self.time_scale).round() as u64
    }

    /// Inverse of [`transform_time`](Self::transform_time), applied to
    /// measured times so reports stay in task units.
    pub fn untransform_time(&self, taken_ms: u64) -> u64 {
        if self.time_scale == 0.0 {
            return taken_ms;
        }
        (taken_ms as f64 / self.time_scale).round() as u64
    }
}

/// Grader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Directory holding per-evaluation build directories
    pub builds_dir: PathBuf,

    /// Directory holding the content-addressed cache folders
    pub cache_dir: PathBuf,

    /// Path to the SQLite cache index
    pub cache_db_path: PathBuf,

    /// Path to the external isolation binary
    pub isolate_bin: PathBuf,

    /// Path to the privilege-fixup companion of the isolation binary
    pub rights_bin: PathBuf,

    /// Path to the external JSON-schema validator (optional feature)
    pub validator_bin: Option<PathBuf>,

    /// Schema for the input document
    pub input_schema: Option<PathBuf>,

    /// Schema for the output report
    pub output_schema: Option<PathBuf>,

    /// Whether the kernel supports control groups (enables cgroup memory
    /// accounting in the isolation tool)
    pub control_groups: bool,

    /// Maximum time to wait for a cache folder lock, in seconds
    pub cache_lock_timeout_secs: u64,

    /// Hard timeout for each isolation-tool invocation, in seconds
    pub tool_timeout_secs: u64,

    /// Upper bound on `timeLimitMs` accepted from the input
    pub max_time_limit_ms: u64,

    /// Upper bound on `memoryLimitKb` accepted from the input
    pub max_memory_limit_kb: u64,

    /// Upper bound on a single captured output file, in kilobytes
    pub max_capture_kb: u64,

    /// Per-language limit transforms, keyed by language key ("c", "cpp", ...)
    pub transforms: HashMap<String, LimitTransform>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        let base = PathBuf::from("files");
        Self {
            builds_dir: base.join("builds"),
            cache_dir: base.join("cache"),
            cache_db_path: base.join("cache").join("index.sqlite"),
            isolate_bin: PathBuf::from("/usr/local/bin/isolate"),
            rights_bin: PathBuf::from("/usr/local/bin/box-rights"),
            validator_bin: None,
            input_schema: None,
            output_schema: None,
            control_groups: false,
            cache_lock_timeout_secs: 60,
            tool_timeout_secs: 60,
            max_time_limit_ms: 60_000,
            max_memory_limit_kb: 1024 * 1024,
            max_capture_kb: 1024,
            transforms: HashMap::new(),
        }
    }
}

impl GraderConfig {
    /// Load configuration from a TOML file over the built-in defaults.
    ///
    /// A `None` path returns the defaults unchanged.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The limit transform for a language (identity when none is configured).
    pub fn transform_for(&self, language: Option<Language>) -> LimitTransform {
        language
            .and_then(|lang| self.transforms.get(lang.key()))
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GraderConfig::default();
        assert_eq!(config.max_time_limit_ms, 60_000);
        assert_eq!(config.max_memory_limit_kb, 1024 * 1024);
        assert!(config.validator_bin.is_none());
    }

    #[test]
    fn identity_transform_by_default() {
        let config = GraderConfig::default();
        let t = config.transform_for(Some(Language::Cpp));
        assert_eq!(t.transform_memory(1000), 1000);
        assert_eq!(t.transform_time(1000), 1000);
        assert_eq!(t.untransform_time(1000), 1000);
    }

    #[test]
    fn transform_round_trip() {
        let t = LimitTransform {
            memory_offset_kb: 4096,
            memory_scale: 1.0,
            time_scale: 2.0,
        };
        assert_eq!(t.transform_memory(1000), 5096);
        assert_eq!(t.transform_time(1000), 2000);
        assert_eq!(t.untransform_time(t.transform_time(1234)), 1234);
    }

    #[test]
    fn load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskmill.toml");
        std::fs::write(
            &path,
            r#"
builds_dir = "/tmp/builds"
max_time_limit_ms = 30000

[transforms.python]
memory_offset_kb = 16384
time_scale = 3.0
"#,
        )
        .unwrap();

        let config = GraderConfig::load(Some(&path)).unwrap();
        assert_eq!(config.builds_dir, PathBuf::from("/tmp/builds"));
        assert_eq!(config.max_time_limit_ms, 30_000);
        // Untouched fields keep their defaults
        assert_eq!(config.max_memory_limit_kb, 1024 * 1024);
        let t = config.transform_for(Some(Language::Python));
        assert_eq!(t.transform_memory(0), 16384);
        assert_eq!(t.transform_time(1000), 3000);
    }

    #[test]
    fn load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "builds_dir = [").unwrap();
        assert!(matches!(
            GraderConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
