//! Execution limits as declared in the input document.

use serde::{Deserialize, Serialize};

use crate::config::GraderConfig;
use crate::exec::ExecError;

/// Resource limits and capture settings for one compile or run step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionLimits {
    /// CPU time limit in milliseconds
    pub time_limit_ms: u64,

    /// Memory limit in kilobytes
    pub memory_limit_kb: u64,

    /// Whether this step may use the cache
    pub use_cache: bool,

    /// Stdout truncate size in kilobytes, negative for unlimited
    pub stdout_truncate_kb: i64,

    /// Stderr truncate size in kilobytes, negative for unlimited
    pub stderr_truncate_kb: i64,

    /// Globs of working-directory files to capture into the report
    pub get_files: Vec<String>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            time_limit_ms: 60_000,
            memory_limit_kb: 128 * 1024,
            use_cache: true,
            stdout_truncate_kb: -1,
            stderr_truncate_kb: -1,
            get_files: Vec::new(),
        }
    }
}

impl ExecutionLimits {
    /// Reject limits above the configured maxima before anything runs.
    pub fn validate(&self, config: &GraderConfig) -> Result<(), ExecError> {
        if self.time_limit_ms > config.max_time_limit_ms {
            return Err(ExecError::TimeLimitTooHigh {
                requested: self.time_limit_ms,
                max: config.max_time_limit_ms,
            });
        }
        if self.memory_limit_kb > config.max_memory_limit_kb {
            return Err(ExecError::MemoryLimitTooHigh {
                requested: self.memory_limit_kb,
                max: config.max_memory_limit_kb,
            });
        }
        Ok(())
    }

    /// Deterministic token folded into cache keys so that any limit change
    /// invalidates the key.
    pub fn cache_token(&self) -> String {
        let mut globs = self.get_files.clone();
        globs.sort();
        format!(
            "time={};mem={};outkb={};errkb={};files={}",
            self.time_limit_ms,
            self.memory_limit_kb,
            self.stdout_truncate_kb,
            self.stderr_truncate_kb,
            globs.join(",")
        )
    }
}
