//! One graded program: compile once, execute repeatedly.
//!
//! A [`Program`] ties a compilation description to the language profile,
//! the execution engine and the cache. `compile()` must resolve (success
//! or failure) before `execute()` is callable; executing an uncompiled or
//! failed program is a programming error, not a graded outcome.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cache::{Cache, CacheKeyBuilder};
use crate::config::GraderConfig;
use crate::error::{GraderError, GraderResult};
use crate::exec::{ExecRequest, ExecutionReport, Executor};
use crate::files::{fetch_file, place_file, FileDescriptor, FileSource, PathAllowList};
use crate::input::CompilationDescr;
use crate::lang::{find_tool, Language};
use crate::limits::ExecutionLimits;

/// Services shared by every program of one evaluation.
pub struct ProgramEnv<'a> {
    pub config: &'a GraderConfig,
    pub cache: &'a Cache,
    pub allow: &'a PathAllowList,
    pub task_path: &'a Path,
}

impl ProgramEnv<'_> {
    fn executor(&self) -> Executor<'_> {
        Executor::new(self.config)
    }
}

/// Program lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgramState {
    Uninitialized,
    CompiledOk,
    CompileFailed,
    /// Number of completed executions
    Executed(u32),
}

/// Parameters of one execution.
pub struct ExecSpec<'a> {
    /// Arguments appended to the executable
    pub args: &'a [String],

    pub limits: &'a ExecutionLimits,

    /// Scoped working directory for this run
    pub working_dir: &'a Path,

    /// File fed to stdin; also folded into the cache key
    pub stdin_file: Option<&'a Path>,

    /// Stdout destination (defaults to `stdout.out`)
    pub stdout_file: Option<&'a Path>,

    /// Additional input files folded into the cache key
    pub extra_inputs: &'a [PathBuf],

    /// Globs of produced files to persist in (and restore from) the cache
    pub output_globs: &'a [String],
}

impl<'a> ExecSpec<'a> {
    pub fn new(limits: &'a ExecutionLimits, working_dir: &'a Path) -> Self {
        Self {
            args: &[],
            limits,
            working_dir,
            stdin_file: None,
            stdout_file: None,
            extra_inputs: &[],
            output_globs: &[],
        }
    }
}

/// A compiled (or compilable) program.
pub struct Program<'a> {
    env: &'a ProgramEnv<'a>,
    name: String,
    descr: &'a CompilationDescr,
    compile_limits: &'a ExecutionLimits,
    language: Language,
    build_dir: PathBuf,
    state: ProgramState,
}

impl<'a> Program<'a> {
    /// Resolve the language profile and verify its required tool is
    /// available; both failures are the UnsupportedLanguage error.
    pub fn new(
        env: &'a ProgramEnv<'a>,
        name: &str,
        descr: &'a CompilationDescr,
        compile_limits: &'a ExecutionLimits,
        build_root: &Path,
    ) -> GraderResult<Self> {
        let language = Language::from_key(&descr.language)
            .ok_or_else(|| GraderError::UnsupportedLanguage(descr.language.clone()))?;
        if find_tool(language.required_tool()).is_none() {
            return Err(GraderError::UnsupportedLanguage(format!(
                "{}: required tool `{}` not found on PATH",
                language.key(),
                language.required_tool()
            )));
        }
        let build_dir = build_root.join(name);
        fs::create_dir_all(&build_dir)?;
        Ok(Self {
            env,
            name: name.to_string(),
            descr,
            compile_limits,
            language,
            build_dir,
            state: ProgramState::Uninitialized,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// True once `compile()` resolved with exit code 0.
    pub fn compiled(&self) -> bool {
        matches!(
            self.state,
            ProgramState::CompiledOk | ProgramState::Executed(_)
        )
    }

    fn exe_name(&self) -> String {
        format!("{}.exe", self.name)
    }

    fn executable(&self) -> PathBuf {
        self.build_dir.join(self.exe_name())
    }

    /// Resolve every declared file to its on-disk location (when it has
    /// one) without copying anything yet. Path references are checked
    /// against the allow-list; dependencies go through the language's
    /// search rules.
    fn resolve_descriptors(&self) -> GraderResult<Vec<(&'a FileDescriptor, Option<PathBuf>)>> {
        let mut resolved = Vec::new();
        for descr in self.descr.files.iter().chain(self.descr.dependencies.iter()) {
            let location = match descr.source()? {
                FileSource::Content(_) => None,
                FileSource::Path(path) => Some(self.env.allow.check(Path::new(path))?),
                FileSource::Dependency => {
                    let found = self
                        .language
                        .dependency_candidates(&descr.name, self.env.task_path)
                        .into_iter()
                        .find(|candidate| candidate.is_file())
                        .ok_or_else(|| GraderError::MissingFile(descr.name.clone()))?;
                    Some(self.env.allow.check(&found)?)
                }
            };
            resolved.push((descr, location));
        }
        Ok(resolved)
    }

    /// Fetch the resolved files into the private build directory.
    fn fetch_into_build_dir(
        &self,
        resolved: &[(&FileDescriptor, Option<PathBuf>)],
    ) -> GraderResult<()> {
        for (descr, location) in resolved {
            match location {
                Some(src) => place_file(src, &self.build_dir.join(&descr.name))?,
                None => {
                    fetch_file(descr, &self.build_dir, self.env.allow)?;
                }
            }
        }
        Ok(())
    }

    /// Compile the program, through the cache when enabled.
    pub fn compile(&mut self) -> GraderResult<ExecutionReport> {
        let resolved = self.resolve_descriptors()?;
        let exe_name = self.exe_name();

        if self.compile_limits.use_cache {
            let mut builder =
                CacheKeyBuilder::new(&format!("compile:{}", self.name), self.compile_limits);
            for (descr, location) in &resolved {
                builder.file(descr, location.as_deref())?;
            }
            let key = builder.finish();

            let mut folder = self.env.cache.get_folder(&key)?;
            if folder.is_complete() {
                folder.restore_file(&exe_name, &self.build_dir)?;
                let mut report = folder.load_report()?;
                report.was_cached = true;
                debug!(program = %self.name, "compile served from cache");
                self.state = ProgramState::CompiledOk;
                return Ok(report);
            }

            let report = self.run_compile(&resolved)?;
            if report.succeeded() {
                folder.add_file(&self.executable())?;
                folder.store_report(&report)?;
                folder.mark_complete()?;
                self.state = ProgramState::CompiledOk;
            } else {
                // Failures are not committed: the folder stays in
                // construction and the next attempt recompiles.
                self.state = ProgramState::CompileFailed;
            }
            return Ok(report);
        }

        let report = self.run_compile(&resolved)?;
        self.state = if report.succeeded() {
            ProgramState::CompiledOk
        } else {
            ProgramState::CompileFailed
        };
        Ok(report)
    }

    fn run_compile(
        &self,
        resolved: &[(&FileDescriptor, Option<PathBuf>)],
    ) -> GraderResult<ExecutionReport> {
        self.fetch_into_build_dir(resolved)?;
        let exe_name = self.exe_name();
        let source_names: Vec<String> =
            self.descr.files.iter().map(|f| f.name.clone()).collect();

        match self.language.compile_command(&exe_name, &source_names) {
            Some(command) => {
                let req = ExecRequest::new(&command, &self.build_dir, self.compile_limits)
                    .language(Some(self.language));
                // Compilation is trusted work and runs unconfined
                let report = self.env.executor().run_direct(&req)?;
                Ok(report)
            }
            None => self.assemble_script(&source_names),
        }
    }

    /// Interpreted languages: concatenate the sources into one executable
    /// script, prepending the interpreter shebang when the first source
    /// lacks one.
    fn assemble_script(&self, source_names: &[String]) -> GraderResult<ExecutionReport> {
        let mut script = Vec::new();
        for name in source_names {
            script.extend(fs::read(self.build_dir.join(name))?);
        }
        if !script.starts_with(b"#!") {
            if let Some(shebang) = self.language.shebang() {
                let mut with_shebang = format!("{shebang}\n").into_bytes();
                with_shebang.extend(script);
                script = with_shebang;
            }
        }
        let exe = self.executable();
        fs::write(&exe, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&exe, fs::Permissions::from_mode(0o755))?;
        }
        Ok(ExecutionReport::synthetic(
            self.compile_limits,
            &format!("assemble {}", self.exe_name()),
        ))
    }

    /// Execute the compiled program, through the cache when enabled.
    pub fn execute(&mut self, spec: &ExecSpec<'_>) -> GraderResult<ExecutionReport> {
        if !self.compiled() {
            return Err(GraderError::ProgramState(format!(
                "program `{}` executed before a successful compile",
                self.name
            )));
        }

        let exe_name = self.exe_name();
        let exe_in_workdir = spec.working_dir.join(&exe_name);
        if exe_in_workdir != self.executable() {
            place_file(&self.executable(), &exe_in_workdir)?;
        }

        let mut command = vec![format!("./{exe_name}")];
        command.extend(spec.args.iter().cloned());

        // The stdout file participates in caching under its plain name
        let stdout_name = spec
            .stdout_file
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stdout.out".to_string());
        let mut cache_globs: Vec<String> = spec.output_globs.to_vec();
        cache_globs.push(stdout_name.clone());

        if spec.limits.use_cache {
            // The restored-by-name artifact set is part of the work's
            // identity: the same run asked to produce `b.in` instead of
            // `a.in` must not be served `a.in` from cache.
            let mut key_globs = cache_globs.clone();
            key_globs.sort();
            let tag = format!(
                "execute:{}:{}:out={}",
                self.name,
                spec.args.join(" "),
                key_globs.join(",")
            );
            let mut builder = CacheKeyBuilder::new(&tag, spec.limits);
            for (descr, location) in self.resolve_descriptors()? {
                builder.file(descr, location.as_deref())?;
            }
            if let Some(stdin) = spec.stdin_file {
                builder.input(stdin)?;
            }
            for input in spec.extra_inputs {
                builder.input(input)?;
            }
            let key = builder.finish();

            let mut folder = self.env.cache.get_folder(&key)?;
            if folder.is_complete() {
                folder.restore_into(spec.working_dir, &cache_globs)?;
                let mut report = folder.load_report()?;
                report.was_cached = true;
                debug!(program = %self.name, "execution served from cache");
                self.bump_executed();
                return Ok(report);
            }

            let report = self.run_once(spec, &command)?;
            for produced in self.produced_files(spec.working_dir, &cache_globs)? {
                folder.add_file(&produced)?;
            }
            folder.store_report(&report)?;
            folder.mark_complete()?;
            self.bump_executed();
            return Ok(report);
        }

        let report = self.run_once(spec, &command)?;
        self.bump_executed();
        Ok(report)
    }

    fn run_once(
        &self,
        spec: &ExecSpec<'_>,
        command: &[String],
    ) -> GraderResult<ExecutionReport> {
        let req = ExecRequest::new(command, spec.working_dir, spec.limits)
            .language(Some(self.language))
            .stdin_file(spec.stdin_file)
            .stdout_file(spec.stdout_file);
        // Untrusted code always goes through the isolated strategy
        Ok(self.env.executor().run_isolated(&req)?)
    }

    /// Working-directory files matching the cache globs, regular files
    /// only (symlinked inputs are someone else's artifacts).
    fn produced_files(&self, dir: &Path, globs: &[String]) -> GraderResult<Vec<PathBuf>> {
        use globset::{Glob, GlobSetBuilder};
        let mut builder = GlobSetBuilder::new();
        for glob in globs {
            builder.add(
                Glob::new(glob)
                    .map_err(|_| GraderError::Input(format!("bad output glob `{glob}`")))?,
            );
        }
        let set = builder
            .build()
            .map_err(|e| GraderError::Input(format!("output glob set: {e}")))?;

        let mut produced = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.path().symlink_metadata()?;
            if set.is_match(&name) && meta.is_file() {
                produced.push(entry.path());
            }
        }
        produced.sort();
        Ok(produced)
    }

    fn bump_executed(&mut self) {
        self.state = match self.state {
            ProgramState::Executed(n) => ProgramState::Executed(n + 1),
            _ => ProgramState::Executed(1),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        config: GraderConfig,
        cache: Cache,
        allow: PathAllowList,
        task_path: PathBuf,
        build_root: PathBuf,
        work_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let config = GraderConfig {
                builds_dir: temp.path().join("builds"),
                cache_dir: temp.path().join("cache"),
                cache_db_path: temp.path().join("cache").join("index.sqlite"),
                ..Default::default()
            };
            let cache = Cache::new(
                &config.cache_dir,
                &config.cache_db_path,
                Duration::from_secs(2),
            );
            let task_path = temp.path().join("task");
            let build_root = temp.path().join("builds");
            let work_dir = temp.path().join("work");
            fs::create_dir_all(&task_path).unwrap();
            fs::create_dir_all(&build_root).unwrap();
            fs::create_dir_all(&work_dir).unwrap();
            Self {
                _temp: temp,
                config,
                cache,
                allow: PathAllowList::default(),
                task_path,
                build_root,
                work_dir,
            }
        }

        fn env(&self) -> ProgramEnv<'_> {
            ProgramEnv {
                config: &self.config,
                cache: &self.cache,
                allow: &self.allow,
                task_path: &self.task_path,
            }
        }
    }

    fn shell_descr(name: &str, content: &str) -> CompilationDescr {
        CompilationDescr {
            language: "shell".to_string(),
            files: vec![FileDescriptor::inline(name, content)],
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn unknown_language_is_unsupported() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let descr = CompilationDescr {
            language: "cobol".to_string(),
            files: vec![],
            dependencies: vec![],
        };
        let limits = ExecutionLimits::default();
        let err = match Program::new(&env, "p", &descr, &limits, &fixture.build_root) {
            Ok(_) => panic!("cobol must not resolve to a language profile"),
            Err(err) => err,
        };
        assert!(matches!(err, GraderError::UnsupportedLanguage(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn execute_before_compile_is_fatal() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let descr = shell_descr("p.sh", "echo hi");
        let limits = ExecutionLimits::default();
        let mut program =
            Program::new(&env, "p", &descr, &limits, &fixture.build_root).unwrap();

        let spec = ExecSpec::new(&limits, &fixture.work_dir);
        assert!(matches!(
            program.execute(&spec),
            Err(GraderError::ProgramState(_))
        ));
    }

    #[test]
    fn shell_program_compiles_and_runs() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let descr = shell_descr("double.sh", "read x\necho $((x * 2))\n");
        let limits = ExecutionLimits::default();
        let mut program =
            Program::new(&env, "double", &descr, &limits, &fixture.build_root).unwrap();

        let compile_report = program.compile().unwrap();
        assert!(compile_report.succeeded());
        assert!(program.compiled());

        let stdin = fixture.work_dir.join("t.in");
        fs::write(&stdin, "21\n").unwrap();
        let mut spec = ExecSpec::new(&limits, &fixture.work_dir);
        spec.stdin_file = Some(&stdin);
        let report = program.execute(&spec).unwrap();
        assert!(report.succeeded());
        assert!(!report.was_cached);
        assert_eq!(report.stdout.data, "42\n");
    }

    #[test]
    fn second_identical_execution_is_cached() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let descr = shell_descr("p.sh", "read x\necho $((x * 2))\n");
        let limits = ExecutionLimits::default();

        let stdin = fixture.work_dir.join("t.in");
        fs::write(&stdin, "21\n").unwrap();

        let run = |work: &Path| {
            let mut program =
                Program::new(&env, "p", &descr, &limits, &fixture.build_root).unwrap();
            program.compile().unwrap();
            let stdin_local = work.join("t.in");
            fs::copy(&stdin, &stdin_local).unwrap();
            let mut spec = ExecSpec::new(&limits, work);
            spec.stdin_file = Some(&stdin_local);
            program.execute(&spec).unwrap()
        };

        let first = run(&fixture.work_dir);
        assert!(!first.was_cached);

        let second_dir = fixture._temp.path().join("work2");
        fs::create_dir_all(&second_dir).unwrap();
        let second = run(&second_dir);
        assert!(second.was_cached);
        assert_eq!(second.stdout.data, first.stdout.data);
        assert_eq!(second.exit_code, first.exit_code);
        // The cached stdout file was restored into the new working dir
        assert!(second_dir.join("stdout.out").exists());
    }

    #[test]
    fn changed_stdout_name_misses_the_cache() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let descr = shell_descr("gen.sh", "echo 21\n");
        let limits = ExecutionLimits::default();
        let mut program =
            Program::new(&env, "gen", &descr, &limits, &fixture.build_root).unwrap();
        program.compile().unwrap();

        let a_out = fixture.work_dir.join("a.in");
        let mut spec = ExecSpec::new(&limits, &fixture.work_dir);
        spec.stdout_file = Some(&a_out);
        let first = program.execute(&spec).unwrap();
        assert!(!first.was_cached);
        assert!(a_out.exists());

        // Same program, args and inputs, but a different stdout
        // destination: serving the first run's folder would leave
        // `b.in` missing entirely.
        let b_out = fixture.work_dir.join("b.in");
        let mut spec = ExecSpec::new(&limits, &fixture.work_dir);
        spec.stdout_file = Some(&b_out);
        let second = program.execute(&spec).unwrap();
        assert!(!second.was_cached, "distinct stdout names must not share a key");
        assert!(b_out.exists());
        assert_eq!(fs::read_to_string(&b_out).unwrap(), "21\n");
    }

    #[test]
    fn changed_input_misses_the_cache() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let descr = shell_descr("p.sh", "read x\necho $((x * 2))\n");
        let limits = ExecutionLimits::default();
        let mut program =
            Program::new(&env, "p", &descr, &limits, &fixture.build_root).unwrap();
        program.compile().unwrap();

        let stdin = fixture.work_dir.join("t.in");
        fs::write(&stdin, "21\n").unwrap();
        let mut spec = ExecSpec::new(&limits, &fixture.work_dir);
        spec.stdin_file = Some(&stdin);
        let first = program.execute(&spec).unwrap();
        assert_eq!(first.stdout.data, "42\n");

        fs::write(&stdin, "50\n").unwrap();
        let second = program.execute(&spec).unwrap();
        assert!(!second.was_cached, "changed stdin must not hit the cache");
        assert_eq!(second.stdout.data, "100\n");
    }

    #[test]
    fn compile_failure_blocks_execution() {
        let fixture = Fixture::new();
        let env = fixture.env();
        // A C "program" that cannot compile; falls back to shell when gcc
        // is absent so the test stays meaningful either way.
        let descr = if find_tool("gcc").is_some() {
            CompilationDescr {
                language: "c".to_string(),
                files: vec![FileDescriptor::inline("bad.c", "this is not C")],
                dependencies: vec![],
            }
        } else {
            return;
        };
        let limits = ExecutionLimits::default();
        let mut program =
            Program::new(&env, "bad", &descr, &limits, &fixture.build_root).unwrap();
        let report = program.compile().unwrap();
        assert!(!report.succeeded());
        assert!(!program.compiled());

        let spec = ExecSpec::new(&limits, &fixture.work_dir);
        assert!(matches!(
            program.execute(&spec),
            Err(GraderError::ProgramState(_))
        ));
    }

    #[test]
    fn missing_dependency_is_a_missing_file() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let descr = CompilationDescr {
            language: "shell".to_string(),
            files: vec![FileDescriptor::inline("p.sh", "echo hi")],
            dependencies: vec![FileDescriptor::dependency("nonexistent.sh")],
        };
        let limits = ExecutionLimits::default();
        let mut program =
            Program::new(&env, "p", &descr, &limits, &fixture.build_root).unwrap();
        assert!(matches!(
            program.compile(),
            Err(GraderError::MissingFile(_))
        ));
    }

    #[test]
    fn dependency_resolved_from_task_modules() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let modules = fixture.task_path.join("modules");
        fs::create_dir_all(&modules).unwrap();
        fs::write(modules.join("lib.sh"), "helper() { echo 7; }\n").unwrap();

        let descr = CompilationDescr {
            language: "shell".to_string(),
            files: vec![FileDescriptor::inline("p.sh", "echo main")],
            dependencies: vec![FileDescriptor::dependency("lib.sh")],
        };
        let limits = ExecutionLimits::default();
        let mut program =
            Program::new(&env, "p", &descr, &limits, &fixture.build_root).unwrap();
        let report = program.compile().unwrap();
        assert!(report.succeeded());
    }
}
