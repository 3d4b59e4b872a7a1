//! Turns raw generator output into a compilable, instrumented program.
//!
//! The instrumentation tool inserts uniquely numbered marker calls at
//! locations whose presence after optimization tells us whether the
//! compiler proved the surrounding code dead.

use crate::config::{InstrumenterSettings, ReferenceSettings};
use crate::generator::{GeneratorError, ProgramGenerator};
use crate::process::{CommandRunner, RunError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

const SEARCH_LIST_START: &str = "#include <...> search starts here:";
const SEARCH_LIST_END: &str = "End of search list.";
const FRAMEWORK_SUFFIX: &str = "(framework directory)";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error("Failed to materialize candidate: {0}")]
    Io(#[from] std::io::Error),
    #[error("Include path resolution failed: {0}")]
    IncludeResolution(String),
    #[error("Instrumenter failed: {0}")]
    Instrument(String),
    /// A helper tool exceeded its time limit. `generate_file` consumes
    /// this by starting over with a fresh candidate.
    #[error("{tool} timed out")]
    Timeout { tool: String },
}

impl PipelineError {
    fn from_run(err: RunError, wrap: fn(String) -> PipelineError) -> Self {
        match err {
            RunError::Timeout { program, .. } => PipelineError::Timeout { tool: program },
            other => wrap(other.to_string()),
        }
    }
}

/// A candidate after instrumentation, ready for the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedProgram {
    pub marker_prefix: String,
    pub code: String,
}

/// Extracts the system header search list from `cc -E -v` diagnostics.
pub fn parse_include_search_list(stderr: &str) -> Vec<PathBuf> {
    stderr
        .lines()
        .skip_while(|line| line.trim() != SEARCH_LIST_START)
        .skip(1)
        .take_while(|line| line.trim() != SEARCH_LIST_END)
        .map(|line| line.trim().trim_end_matches(FRAMEWORK_SUFFIX).trim())
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Asks a known-good compiler which directories it searches for headers.
#[derive(Debug, Clone)]
pub struct IncludeResolver {
    compiler: PathBuf,
    runner: CommandRunner,
}

impl IncludeResolver {
    pub fn new(settings: &ReferenceSettings) -> Self {
        Self {
            compiler: settings.compiler.clone(),
            runner: CommandRunner::with_timeout_ms(settings.timeout_ms),
        }
    }

    pub fn resolve(&self, file: &Path, flags: &[String]) -> Result<Vec<PathBuf>, PipelineError> {
        let mut cmd = Command::new(&self.compiler);
        cmd.arg("-E").arg("-v").args(flags).arg(file).arg("-o").arg("/dev/null");

        let output = self
            .runner
            .run(&mut cmd, None)
            .map_err(|e| PipelineError::from_run(e, PipelineError::IncludeResolution))?;
        if !output.success() {
            return Err(PipelineError::IncludeResolution(format!(
                "{:?} {}: {}",
                self.compiler,
                output.describe_exit(),
                output.stderr_lossy().trim()
            )));
        }
        Ok(parse_include_search_list(&output.stderr_lossy()))
    }
}

/// Wrapper around the external marker-insertion tool.
#[derive(Debug, Clone)]
pub struct Instrumenter {
    executable: PathBuf,
    marker_prefix: String,
    runner: CommandRunner,
}

impl Instrumenter {
    pub fn new(settings: &InstrumenterSettings) -> Self {
        Self {
            executable: settings.executable.clone(),
            marker_prefix: settings.marker_prefix.clone(),
            runner: CommandRunner::with_timeout_ms(settings.timeout_ms),
        }
    }

    pub fn marker_prefix(&self) -> &str {
        &self.marker_prefix
    }

    /// Rewrites `file` in place and returns the marker prefix it used.
    pub fn instrument(&self, file: &Path, include_paths: &[PathBuf]) -> Result<String, PipelineError> {
        let mut cmd = Command::new(&self.executable);
        cmd.arg(file);
        for path in include_paths {
            cmd.arg(format!("--extra-arg=-isystem{}", path.display()));
        }

        let output = self
            .runner
            .run(&mut cmd, None)
            .map_err(|e| PipelineError::from_run(e, PipelineError::Instrument))?;
        if !output.success() {
            return Err(PipelineError::Instrument(format!(
                "{:?} {}: {}",
                self.executable,
                output.describe_exit(),
                output.stderr_lossy().trim()
            )));
        }
        Ok(self.marker_prefix.clone())
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentationPipeline {
    resolver: IncludeResolver,
    instrumenter: Instrumenter,
}

impl InstrumentationPipeline {
    pub fn new(resolver: IncludeResolver, instrumenter: Instrumenter) -> Self {
        Self {
            resolver,
            instrumenter,
        }
    }

    /// Produces one instrumented program within the generator's size bounds.
    ///
    /// Loops until a candidate makes it through. Timeouts of any of the
    /// tools involved restart the loop without limit; only an exhausted
    /// generator or a broken helper tool ends it with an error.
    pub fn generate_file(
        &self,
        generator: &mut dyn ProgramGenerator,
        extra_flags: &[String],
    ) -> Result<InstrumentedProgram, PipelineError> {
        let mut flags = extra_flags.to_vec();
        if let Some(include) = &generator.settings().include_path {
            flags.push(format!("-I{}", include.display()));
        }

        loop {
            debug!("Generating new candidate...");
            let candidate = match generator.produce() {
                Ok(candidate) => candidate,
                Err(GeneratorError::Timeout { tool }) => {
                    debug!(tool, "Generator timed out, starting over");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let settings = generator.settings();
            if !settings.accepts_size(candidate.len()) {
                debug!(
                    len = candidate.len(),
                    min = settings.min_size,
                    max = settings.max_size,
                    "Candidate size out of bounds, discarding"
                );
                continue;
            }
            let generator_include = settings.include_path.clone();

            match self.instrument_candidate(&candidate, &flags, generator_include) {
                Ok(program) => return Ok(program),
                Err(PipelineError::Timeout { tool }) => {
                    debug!(tool = %tool, "Helper tool timed out, starting over");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn instrument_candidate(
        &self,
        candidate: &str,
        flags: &[String],
        generator_include: Option<PathBuf>,
    ) -> Result<InstrumentedProgram, PipelineError> {
        // Removed when dropped, whichever way we leave this function.
        let mut file = tempfile::Builder::new()
            .prefix("dcesift-")
            .suffix(".c")
            .tempfile()?;
        writeln!(file, "{candidate}")?;
        file.flush()?;

        let mut include_paths = self.resolver.resolve(file.path(), flags)?;
        include_paths.extend(generator_include);

        debug!("Instrumenting candidate...");
        let marker_prefix = self.instrumenter.instrument(file.path(), &include_paths)?;
        let code = fs::read_to_string(file.path())?;

        Ok(InstrumentedProgram {
            marker_prefix,
            code,
        })
    }
}
