//! Typed evaluation input document.
//!
//! The raw document arrives on standard input with `@variable` references
//! and path placeholders still embedded; [`crate::vars`] resolves those
//! before this tree is deserialized, so every field here is concrete.

use serde::{Deserialize, Serialize};

use crate::files::FileDescriptor;
use crate::limits::ExecutionLimits;

/// Compilation description: language plus sources and build dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationDescr {
    /// Language key ("c", "cpp", "python", ...)
    pub language: String,

    /// Source files, in declaration order
    pub files: Vec<FileDescriptor>,

    /// Build dependencies fetched alongside the sources
    #[serde(default)]
    pub dependencies: Vec<FileDescriptor>,
}

/// A program that is only compiled up front (generator, solution).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledUnit {
    pub compilation_descr: CompilationDescr,
    pub compilation_execution: ExecutionLimits,
}

/// Generator declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorDescr {
    pub id: String,
    #[serde(flatten)]
    pub unit: CompiledUnit,
}

/// Solution declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionDescr {
    pub id: String,
    #[serde(flatten)]
    pub unit: CompiledUnit,
}

/// A program compiled and then run by the pipeline itself (sanitizer,
/// checker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableDescr {
    #[serde(flatten)]
    pub unit: CompiledUnit,
    pub run_execution: ExecutionLimits,
}

/// Explicit named test case of a generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    /// Base name of the produced test ("{name}.in" / "{name}.out")
    pub name: String,

    /// Command-line parameters passed to the generator
    #[serde(default)]
    pub params: String,
}

/// One configured invocation of a generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationDescr {
    pub id: String,

    /// Generator producing test inputs
    pub id_generator: String,

    pub gen_execution: ExecutionLimits,

    /// Paired generator producing expected outputs, when any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_output_generator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_output_execution: Option<ExecutionLimits>,

    /// Explicit test cases; empty means "run once and glob-capture"
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

/// Binding of one solution to test files and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDescr {
    pub id: String,

    pub id_solution: String,

    /// Test-file globs, processed in declaration order
    pub filter_tests: Vec<String>,

    pub run_execution: ExecutionLimits,
}

/// The full evaluation document, post variable resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationInput {
    /// Root directory all relative paths resolve under
    pub root_path: String,

    /// Task directory (holds `defaultParams.json` and task files)
    pub task_path: String,

    /// Path allow-list; empty means unrestricted
    #[serde(default)]
    pub restrict_to_paths: Vec<String>,

    #[serde(default)]
    pub generators: Vec<GeneratorDescr>,

    #[serde(default)]
    pub generations: Vec<GenerationDescr>,

    /// Extra test files merged in after generation
    #[serde(default)]
    pub extra_tests: Vec<FileDescriptor>,

    pub sanitizer: RunnableDescr,

    pub checker: RunnableDescr,

    pub solutions: Vec<SolutionDescr>,

    pub executions: Vec<ExecutionDescr>,
}
