//! The evaluation report emitted on standard output.
//!
//! Mirrors the pipeline stages: compile reports for every configured
//! program, one entry per generation, and per-execution test reports. On a
//! fatal error the best-effort partial report is still emitted; stages
//! that never ran stay absent.

use serde::{Deserialize, Serialize};

use crate::exec::ExecutionReport;

/// Compile report of one named program.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledReport {
    pub id: String,
    pub compilation_execution: ExecutionReport,
}

/// Reports of one generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub id: String,

    /// Input-generator executions (one per explicit test case, or a single
    /// glob-capturing run)
    pub generator_executions: Vec<ExecutionReport>,

    /// Output-generator executions, when an output generator is paired
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_generator_executions: Vec<ExecutionReport>,
}

/// Report of one test against one solution.
///
/// Field presence encodes how far the test went: a sanitizer rejection
/// carries no `execution`; a solution failure carries no `checker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    /// Test file name
    pub name: String,

    pub sanitizer: ExecutionReport,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker: Option<ExecutionReport>,
}

/// Reports of one configured execution (one solution over its matched
/// tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResultSet {
    pub id: String,

    /// The bound solution's id
    pub name: String,

    pub tests_reports: Vec<TestReport>,
}

/// The full evaluation report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReport {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generators: Vec<CompiledReport>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generations: Vec<GenerationReport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitizer: Option<ExecutionReport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker: Option<ExecutionReport>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub solutions: Vec<CompiledReport>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executions: Vec<ExecutionResultSet>,
}
