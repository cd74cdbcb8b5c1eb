//! Taskmill - Contest task evaluation engine
//!
//! This crate implements taskmill, a batch grader for programming-contest
//! tasks: it reads one JSON evaluation request on standard input, compiles
//! the task's generators, sanitizer, checker and candidate solutions,
//! produces the test files, runs every solution over its matched tests
//! under resource limits (sandboxed when the isolation tool is installed),
//! and writes one JSON report on standard output. Compile and run results
//! are content-addressed and cached across evaluations.

pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod files;
pub mod input;
pub mod lang;
pub mod limits;
pub mod pipeline;
pub mod program;
pub mod report;
pub mod schema;
pub mod vars;

pub use config::GraderConfig;
pub use error::{GraderError, GraderResult};
pub use exec::{ExecRequest, ExecutionReport, Executor};
pub use input::EvaluationInput;
pub use limits::ExecutionLimits;
pub use pipeline::evaluate;
pub use report::EvaluationReport;
