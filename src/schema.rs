//! Optional JSON-schema validation of the input and output documents.
//!
//! Validation is delegated to an external validator command configured in
//! [`GraderConfig`]: it receives the schema path as its argument and the
//! document on stdin, and exits non-zero on violations. When no validator
//! or schema is configured the step is skipped with a log line; a
//! validation failure is fatal.

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::GraderConfig;
use crate::error::{GraderError, GraderResult};
use crate::exec::watchdog;

/// Which document is being validated; selects the configured schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Input,
    Output,
}

impl SchemaKind {
    fn label(&self) -> &'static str {
        match self {
            SchemaKind::Input => "input",
            SchemaKind::Output => "output",
        }
    }
}

/// Validate `document` against the configured schema for `kind`.
///
/// Skipped (with a warning) when no validator binary or no schema path is
/// configured, so a bare deployment still works end to end.
pub fn validate(config: &GraderConfig, kind: SchemaKind, document: &str) -> GraderResult<()> {
    let Some(validator) = config.validator_bin.as_deref() else {
        debug!(kind = kind.label(), "no schema validator configured, skipping");
        return Ok(());
    };
    let schema = match kind {
        SchemaKind::Input => config.input_schema.as_deref(),
        SchemaKind::Output => config.output_schema.as_deref(),
    };
    let Some(schema) = schema else {
        warn!(kind = kind.label(), "schema validator configured but no schema path, skipping");
        return Ok(());
    };

    let mut child = Command::new(validator)
        .arg(schema)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            GraderError::Schema(format!(
                "cannot start validator `{}`: {e}",
                validator.display()
            ))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // A validator that exits early closes its end; that is its answer,
        // not an I/O failure on ours.
        let _ = stdin.write_all(document.as_bytes());
    }

    let timeout = Duration::from_secs(config.tool_timeout_secs);
    let outcome = watchdog::wait_with_deadline(&mut child, timeout)
        .map_err(|e| GraderError::Schema(format!("validator wait failed: {e}")))?;
    if outcome.killed {
        return Err(GraderError::Schema(format!(
            "validator `{}` exceeded its {timeout:?} timeout",
            validator.display()
        )));
    }

    if outcome.status.success() {
        debug!(kind = kind.label(), "schema validation passed");
        Ok(())
    } else {
        let mut detail = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            use std::io::Read;
            let _ = stderr.read_to_string(&mut detail);
        }
        Err(GraderError::Schema(format!(
            "{} document rejected by schema: {}",
            kind.label(),
            detail.trim()
        )))
    }
}
