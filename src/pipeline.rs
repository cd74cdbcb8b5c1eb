//! The evaluation pipeline.
//!
//! One evaluation flows through fixed stages: resolve variables, compile
//! the generators, produce the test files, compile sanitizer and checker,
//! compile the solutions, then grade every execution. Per-unit failures
//! (a solution that does not compile, a test the sanitizer rejects) stay
//! in the report; a failed trusted stage aborts with the partial report
//! kept.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use globset::Glob;
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::config::GraderConfig;
use crate::error::{GraderError, GraderResult};
use crate::files::{fetch_file, place_file, PathAllowList};
use crate::input::{EvaluationInput, GenerationDescr};
use crate::program::{ExecSpec, Program, ProgramEnv};
use crate::report::{
    CompiledReport, EvaluationReport, ExecutionResultSet, GenerationReport, TestReport,
};
use crate::vars::VarContext;

/// Stream names the engine itself produces; never collected as test files.
const ENGINE_ARTIFACTS: &[&str] = &["stdout.out", "stderr.out"];

/// Evaluate a raw input document.
///
/// The report reflects every stage that ran, even when a later stage
/// failed; the error (when any) decides the process exit code.
pub fn evaluate(config: &GraderConfig, raw: Value) -> (EvaluationReport, Option<GraderError>) {
    let mut report = EvaluationReport::default();
    match run(config, raw, &mut report) {
        Ok(()) => (report, None),
        Err(err) => (report, Some(err)),
    }
}

fn run(config: &GraderConfig, raw: Value, report: &mut EvaluationReport) -> GraderResult<()> {
    let root_path = raw
        .get("rootPath")
        .and_then(Value::as_str)
        .ok_or_else(|| GraderError::Input("rootPath missing or not a string".to_string()))?
        .to_string();
    let task_path = raw
        .get("taskPath")
        .and_then(Value::as_str)
        .ok_or_else(|| GraderError::Input("taskPath missing or not a string".to_string()))?
        .replace("$ROOT_PATH", &root_path);
    let task_path = PathBuf::from(task_path);

    let build_dir = config.builds_dir.join(format!(
        "build_{}_{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        std::process::id()
    ));
    fs::create_dir_all(&build_dir)?;
    info!(build = %build_dir.display(), task = %task_path.display(), "evaluation started");

    let extra_params = raw.get("extraParams").cloned();
    let ctx = VarContext::load(
        &task_path,
        &root_path,
        &build_dir.display().to_string(),
        extra_params.as_ref(),
    )?;
    let resolved = ctx.resolve(raw)?;
    let input: EvaluationInput = serde_json::from_value(resolved)?;

    // A declared restriction implicitly covers the root and task trees:
    // the task's own files and `modules/` dependencies live there, and a
    // task must not be able to lock itself out of them.
    let allow = if input.restrict_to_paths.is_empty() {
        PathAllowList::default()
    } else {
        let mut roots = input.restrict_to_paths.clone();
        roots.push(root_path.clone());
        roots.push(task_path.display().to_string());
        PathAllowList::new(&roots)
    };
    let cache = Cache::new(
        &config.cache_dir,
        &config.cache_db_path,
        Duration::from_secs(config.cache_lock_timeout_secs),
    );
    let env = ProgramEnv {
        config,
        cache: &cache,
        allow: &allow,
        task_path: &task_path,
    };

    let generators_dir = build_dir.join("generators");
    let tools_dir = build_dir.join("tools");
    let solutions_dir = build_dir.join("solutions");
    let tests_dir = build_dir.join("tests");
    fs::create_dir_all(&tests_dir)?;

    // Stage 1: compile the generators. A generator that does not build
    // leaves nothing to grade against, so this stage is all-or-nothing.
    let mut generators: HashMap<&str, Program<'_>> = HashMap::new();
    for descr in &input.generators {
        let mut program = Program::new(
            &env,
            &descr.id,
            &descr.unit.compilation_descr,
            &descr.unit.compilation_execution,
            &generators_dir,
        )?;
        let compiled = program.compile()?;
        let ok = compiled.succeeded();
        report.generators.push(CompiledReport {
            id: descr.id.clone(),
            compilation_execution: compiled,
        });
        if !ok {
            return Err(GraderError::StageFailed {
                stage: format!("generator `{}`", descr.id),
            });
        }
        generators.insert(descr.id.as_str(), program);
    }

    // Stage 2: run the generations and collect the produced test files.
    for generation in &input.generations {
        let gen_report = run_generation(&build_dir, &tests_dir, &mut generators, generation)?;
        report.generations.push(gen_report);
    }
    for descr in &input.extra_tests {
        fetch_file(descr, &tests_dir, &allow)?;
    }

    // Stage 3: compile sanitizer and checker. Both are trusted programs;
    // a build failure aborts the evaluation.
    let mut sanitizer = Program::new(
        &env,
        "sanitizer",
        &input.sanitizer.unit.compilation_descr,
        &input.sanitizer.unit.compilation_execution,
        &tools_dir,
    )?;
    let compiled = sanitizer.compile()?;
    let ok = compiled.succeeded();
    report.sanitizer = Some(compiled);
    if !ok {
        return Err(GraderError::StageFailed {
            stage: "sanitizer".to_string(),
        });
    }

    let mut checker = Program::new(
        &env,
        "checker",
        &input.checker.unit.compilation_descr,
        &input.checker.unit.compilation_execution,
        &tools_dir,
    )?;
    let compiled = checker.compile()?;
    let ok = compiled.succeeded();
    report.checker = Some(compiled);
    if !ok {
        return Err(GraderError::StageFailed {
            stage: "checker".to_string(),
        });
    }

    // Stage 4: compile the solutions. A solution that fails to build is
    // recorded and skipped; the other solutions still get graded.
    let mut solutions: HashMap<&str, Program<'_>> = HashMap::new();
    for descr in &input.solutions {
        let mut program = Program::new(
            &env,
            &descr.id,
            &descr.unit.compilation_descr,
            &descr.unit.compilation_execution,
            &solutions_dir,
        )?;
        let compiled = program.compile()?;
        let ok = compiled.succeeded();
        report.solutions.push(CompiledReport {
            id: descr.id.clone(),
            compilation_execution: compiled,
        });
        if ok {
            solutions.insert(descr.id.as_str(), program);
        } else {
            warn!(solution = %descr.id, "solution failed to compile, its executions are skipped");
        }
    }

    // Stage 5: grade every execution.
    for execution in &input.executions {
        let Some(solution) = solutions.get_mut(execution.id_solution.as_str()) else {
            if input.solutions.iter().any(|s| s.id == execution.id_solution) {
                warn!(execution = %execution.id, solution = %execution.id_solution,
                    "skipping execution of uncompiled solution");
                continue;
            }
            return Err(GraderError::Input(format!(
                "execution `{}` references unknown solution `{}`",
                execution.id, execution.id_solution
            )));
        };

        let exec_dir = build_dir.join("executions").join(&execution.id);
        let tests = matched_tests(&tests_dir, &execution.filter_tests)?;
        info!(execution = %execution.id, tests = tests.len(), "grading");

        let mut tests_reports = Vec::with_capacity(tests.len());
        for test_name in &tests {
            let test_report = grade_test(
                &exec_dir,
                &tests_dir,
                test_name,
                &mut sanitizer,
                solution,
                &execution.run_execution,
                &mut checker,
                &input,
            )?;
            tests_reports.push(test_report);
        }
        report.executions.push(ExecutionResultSet {
            id: execution.id.clone(),
            name: execution.id_solution.clone(),
            tests_reports,
        });
    }

    info!("evaluation finished");
    Ok(())
}

/// Run one generation: every explicit test case, or a single capturing run
/// when no cases are declared. Produced `*.in` / `*.out` files move to the
/// shared tests directory.
fn run_generation(
    build_dir: &Path,
    tests_dir: &Path,
    generators: &mut HashMap<&str, Program<'_>>,
    generation: &GenerationDescr,
) -> GraderResult<GenerationReport> {
    let gen_dir = build_dir.join("generations").join(&generation.id);
    fs::create_dir_all(&gen_dir)?;

    let mut gen_report = GenerationReport {
        id: generation.id.clone(),
        generator_executions: Vec::new(),
        output_generator_executions: Vec::new(),
    };

    let test_globs = ["*.in".to_string(), "*.out".to_string()];

    if generation.test_cases.is_empty() {
        // One run; the generator writes its test files straight into the
        // working directory.
        let report = {
            let generator = generators
                .get_mut(generation.id_generator.as_str())
                .ok_or_else(|| unknown_generator(generation, &generation.id_generator))?;
            let mut spec = ExecSpec::new(&generation.gen_execution, &gen_dir);
            spec.output_globs = &test_globs;
            generator.execute(&spec)?
        };
        ensure_generation_succeeded(generation, &report)?;
        gen_report.generator_executions.push(report);
        collect_tests(&gen_dir, tests_dir)?;
        return Ok(gen_report);
    }

    for case in &generation.test_cases {
        let case_dir = gen_dir.join(&case.name);
        fs::create_dir_all(&case_dir)?;
        let args: Vec<String> = case.params.split_whitespace().map(String::from).collect();

        // The generator's stdout is the test input.
        let input_file = case_dir.join(format!("{}.in", case.name));
        let report = {
            let generator = generators
                .get_mut(generation.id_generator.as_str())
                .ok_or_else(|| unknown_generator(generation, &generation.id_generator))?;
            let mut spec = ExecSpec::new(&generation.gen_execution, &case_dir);
            spec.args = &args;
            spec.stdout_file = Some(&input_file);
            spec.output_globs = &test_globs;
            generator.execute(&spec)?
        };
        ensure_generation_succeeded(generation, &report)?;
        gen_report.generator_executions.push(report);

        // A paired output generator's stdout is the expected output.
        if let Some(out_id) = &generation.id_output_generator {
            let limits = generation
                .gen_output_execution
                .as_ref()
                .unwrap_or(&generation.gen_execution);
            let output_file = case_dir.join(format!("{}.out", case.name));
            let report = {
                let generator = generators
                    .get_mut(out_id.as_str())
                    .ok_or_else(|| unknown_generator(generation, out_id))?;
                let mut spec = ExecSpec::new(limits, &case_dir);
                spec.args = &args;
                spec.stdin_file = Some(&input_file);
                spec.stdout_file = Some(&output_file);
                spec.output_globs = &test_globs;
                spec.extra_inputs = std::slice::from_ref(&input_file);
                generator.execute(&spec)?
            };
            ensure_generation_succeeded(generation, &report)?;
            gen_report.output_generator_executions.push(report);
        }

        collect_tests(&case_dir, tests_dir)?;
    }

    Ok(gen_report)
}

fn unknown_generator(generation: &GenerationDescr, id: &str) -> GraderError {
    GraderError::Input(format!(
        "generation `{}` references unknown generator `{id}`",
        generation.id
    ))
}

/// Generators are trusted: a failing run means the task is broken.
fn ensure_generation_succeeded(
    generation: &GenerationDescr,
    report: &crate::exec::ExecutionReport,
) -> GraderResult<()> {
    if report.succeeded() {
        Ok(())
    } else {
        Err(GraderError::StageFailed {
            stage: format!("generation `{}`", generation.id),
        })
    }
}

/// Copy produced test files (`*.in`, `*.out`) into the shared tests
/// directory, skipping the engine's own stream files.
fn collect_tests(from: &Path, tests_dir: &Path) -> GraderResult<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if ENGINE_ARTIFACTS.contains(&name.as_str()) {
            continue;
        }
        if !(name.ends_with(".in") || name.ends_with(".out")) {
            continue;
        }
        // fs::copy follows symlinks, so cache-restored files copy cleanly
        fs::copy(entry.path(), tests_dir.join(&name))?;
    }
    Ok(())
}

/// Test files matching the filter globs, in glob declaration order and
/// deduplicated; within one glob, name order.
fn matched_tests(tests_dir: &Path, filters: &[String]) -> GraderResult<Vec<String>> {
    let mut available: Vec<String> = Vec::new();
    for entry in fs::read_dir(tests_dir)? {
        let entry = entry?;
        if entry.path().is_file() {
            available.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    available.sort();

    let mut matched = Vec::new();
    for filter in filters {
        let glob = Glob::new(filter)
            .map_err(|_| GraderError::Input(format!("bad test filter `{filter}`")))?
            .compile_matcher();
        for name in &available {
            if glob.is_match(name) && !matched.contains(name) {
                matched.push(name.clone());
            }
        }
    }
    Ok(matched)
}

/// Grade one test: sanitize the input, run the solution, check its output.
/// Each step only happens when the previous one accepted; the report's
/// field presence tells how far the test went.
#[allow(clippy::too_many_arguments)]
fn grade_test(
    exec_dir: &Path,
    tests_dir: &Path,
    test_name: &str,
    sanitizer: &mut Program<'_>,
    solution: &mut Program<'_>,
    run_limits: &crate::limits::ExecutionLimits,
    checker: &mut Program<'_>,
    input: &EvaluationInput,
) -> GraderResult<TestReport> {
    let stem = test_name.strip_suffix(".in").unwrap_or(test_name);
    let test_dir = exec_dir.join(stem);
    fs::create_dir_all(&test_dir)?;

    let test_input = test_dir.join(test_name);
    place_file(&tests_dir.join(test_name), &test_input)?;

    // Sanitizer: a rejection (non-zero exit) discards the test.
    let sanitizer_report = {
        let mut spec = ExecSpec::new(&input.sanitizer.run_execution, &test_dir);
        spec.stdin_file = Some(&test_input);
        sanitizer.execute(&spec)?
    };
    if !sanitizer_report.succeeded() {
        warn!(test = test_name, "test rejected by sanitizer");
        return Ok(TestReport {
            name: test_name.to_string(),
            sanitizer: sanitizer_report,
            execution: None,
            checker: None,
        });
    }

    // Solution run; its failure is a graded outcome, not an engine error.
    let solution_output = test_dir.join(format!("{stem}.solout"));
    let solution_report = {
        let mut spec = ExecSpec::new(run_limits, &test_dir);
        spec.stdin_file = Some(&test_input);
        spec.stdout_file = Some(&solution_output);
        solution.execute(&spec)?
    };
    if !solution_report.succeeded() {
        return Ok(TestReport {
            name: test_name.to_string(),
            sanitizer: sanitizer_report,
            execution: Some(solution_report),
            checker: None,
        });
    }

    // Expected output: the paired `.out` test file, or empty when the task
    // ships none (the checker then judges from the input alone).
    let expected_name = format!("{stem}.out");
    let expected = test_dir.join(&expected_name);
    let shipped = tests_dir.join(&expected_name);
    if shipped.is_file() {
        place_file(&shipped, &expected)?;
    } else if !expected.exists() {
        fs::write(&expected, b"")?;
    }

    let checker_args = vec![
        format!("{stem}.solout"),
        test_name.to_string(),
        expected_name,
    ];
    let checker_inputs = vec![solution_output.clone(), test_input.clone()];
    let checker_report = {
        let mut spec = ExecSpec::new(&input.checker.run_execution, &test_dir);
        spec.args = &checker_args;
        // Expected output doubles as the checker's stdin
        spec.stdin_file = Some(&expected);
        spec.extra_inputs = &checker_inputs;
        checker.execute(&spec)?
    };

    Ok(TestReport {
        name: test_name.to_string(),
        sanitizer: sanitizer_report,
        execution: Some(solution_report),
        checker: Some(checker_report),
    })
}
