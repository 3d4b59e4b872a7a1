use crate::config::{GeneratorKind, GeneratorSettings};
use crate::process::{CommandRunner, ProcessOutput, RunError};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

/// Consecutive failed CSmith invocations tolerated; one more is fatal.
pub const CSMITH_MAX_FAILURES: usize = 10;
/// Consecutive failed YARPGen invocations tolerated; one more is fatal.
pub const YARPGEN_MAX_FAILURES: usize = 100;

const CSMITH_FIXED_FLAGS: [&str; 5] = [
    "--no-unions",
    "--safe-math",
    "--no-argc",
    "--no-volatiles",
    "--no-volatile-pointers",
];

const CSMITH_FEATURES: [&str; 21] = [
    "arrays",
    "bitfields",
    "checksum",
    "comma-operators",
    "compound-assignment",
    "consts",
    "divs",
    "embedded-assigns",
    "jumps",
    "longlong",
    "force-non-uniform-arrays",
    "math64",
    "muls",
    "packed-struct",
    "paranoid",
    "pointers",
    "structs",
    "inline-function",
    "return-structs",
    "arg-structs",
    "dangling-global-pointers",
];

const YARPGEN_TRISTATE_OPTIONS: [&str; 4] = [
    "inp-as-args",
    "emit-align-attr",
    "emit-pragmas",
    "allow-ub-in-dc",
];
const YARPGEN_TRISTATE_VALUES: [&str; 3] = ["none", "some", "all"];
const YARPGEN_BOOL_OPTIONS: [&str; 3] = ["allow-dead-data", "param-shuffle", "expl-loop-param"];
const YARPGEN_BOOL_VALUES: [&str; 2] = ["true", "false"];
const YARPGEN_MUTATE_VALUES: [&str; 3] = ["none", "exprs", "all"];
const YARPGEN_ALIGN_SIZES: [&str; 3] = ["16", "32", "64"];

/// YARPGen writes `func.c` with a self-include of `init.h` on this (0-based) line.
const YARPGEN_INIT_INCLUDE_LINE: usize = 5;
const YARPGEN_INIT_INCLUDE: &str = "#include \"init.h\"";

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("{tool} failed {attempts} times in a row")]
    Exhausted { tool: &'static str, attempts: usize },
    #[error("{tool} invocation timed out")]
    Timeout { tool: &'static str },
    #[error("Generator I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces one random C program per call.
pub trait ProgramGenerator: Send {
    fn name(&self) -> &'static str;

    fn settings(&self) -> &GeneratorSettings;

    /// Flags every compiler setting needs to build this generator's output.
    fn scenario_flags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Runs the external generator until it succeeds.
    ///
    /// A timed-out invocation returns [`GeneratorError::Timeout`] right
    /// away and is not charged to the failure budget; any other failure is
    /// retried until the budget runs out.
    fn produce(&mut self) -> Result<String, GeneratorError>;
}

/// Result of one generator invocation.
enum Attempt {
    Program(String),
    Failed,
}

/// Repeats `attempt` until it yields a program, giving up once more than
/// `max_failures` consecutive failures have piled up.
fn retry_invocations<F>(
    tool: &'static str,
    max_failures: usize,
    mut attempt: F,
) -> Result<String, GeneratorError>
where
    F: FnMut() -> Result<Attempt, GeneratorError>,
{
    let mut failures = 0;
    loop {
        match attempt()? {
            Attempt::Program(program) => return Ok(program),
            Attempt::Failed => {
                failures += 1;
                if failures > max_failures {
                    return Err(GeneratorError::Exhausted {
                        tool,
                        attempts: failures,
                    });
                }
            }
        }
    }
}

/// Maps a finished invocation onto the retry policy shared by all generators.
fn classify(
    tool: &'static str,
    result: Result<ProcessOutput, RunError>,
) -> Result<Option<ProcessOutput>, GeneratorError> {
    match result {
        Ok(output) if output.success() => Ok(Some(output)),
        Ok(output) => {
            debug!(tool, "Generator failed: {}", output.describe_exit());
            Ok(None)
        }
        Err(RunError::Timeout { .. }) => Err(GeneratorError::Timeout { tool }),
        Err(e) => {
            warn!(tool, "Generator invocation failed: {e}");
            Ok(None)
        }
    }
}

pub struct CsmithGenerator<R> {
    settings: GeneratorSettings,
    runner: CommandRunner,
    rng: R,
}

impl<R: Rng> CsmithGenerator<R> {
    pub fn new(settings: GeneratorSettings, rng: R) -> Self {
        let runner = CommandRunner::with_timeout_ms(settings.timeout_ms);
        Self {
            settings,
            runner,
            rng,
        }
    }

    /// Fixed safety flags followed by a coin flip for every feature.
    pub fn arguments(&mut self) -> Vec<String> {
        let mut args: Vec<String> = CSMITH_FIXED_FLAGS.iter().map(|f| f.to_string()).collect();
        for feature in CSMITH_FEATURES {
            if self.rng.random_bool(0.5) {
                args.push(format!("--{feature}"));
            } else {
                args.push(format!("--no-{feature}"));
            }
        }
        args
    }
}

impl<R: Rng + Send> ProgramGenerator for CsmithGenerator<R> {
    fn name(&self) -> &'static str {
        "csmith"
    }

    fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    fn scenario_flags(&self) -> Vec<String> {
        self.settings
            .include_path
            .iter()
            .map(|path| format!("-I{}", path.display()))
            .collect()
    }

    fn produce(&mut self) -> Result<String, GeneratorError> {
        retry_invocations("csmith", CSMITH_MAX_FAILURES, || {
            let mut cmd = Command::new(&self.settings.executable);
            cmd.args(self.arguments());
            let result = self.runner.run(&mut cmd, None);
            Ok(match classify("csmith", result)? {
                Some(output) => Attempt::Program(output.stdout_lossy()),
                None => Attempt::Failed,
            })
        })
    }
}

pub struct YarpgenGenerator<R> {
    settings: GeneratorSettings,
    runner: CommandRunner,
    rng: R,
}

impl<R: Rng> YarpgenGenerator<R> {
    pub fn new(settings: GeneratorSettings, rng: R) -> Self {
        let runner = CommandRunner::with_timeout_ms(settings.timeout_ms);
        Self {
            settings,
            runner,
            rng,
        }
    }

    pub fn arguments(&mut self, out_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--std=c".to_string(),
            format!("--out-dir={}", out_dir.display()),
        ];
        for option in YARPGEN_TRISTATE_OPTIONS {
            args.push(format!("--{option}={}", self.pick(&YARPGEN_TRISTATE_VALUES)));
        }
        for option in YARPGEN_BOOL_OPTIONS {
            args.push(format!("--{option}={}", self.pick(&YARPGEN_BOOL_VALUES)));
        }
        args.push(format!("--mutate={}", self.pick(&YARPGEN_MUTATE_VALUES)));
        args.push(format!("--align-size={}", self.pick(&YARPGEN_ALIGN_SIZES)));
        args
    }

    fn pick(&mut self, values: &[&'static str]) -> &'static str {
        values[self.rng.random_range(0..values.len())]
    }
}

/// Joins YARPGen's `driver.c` and `func.c` into one translation unit.
///
/// Returns `None` when `func.c` does not carry the `init.h` include at the
/// expected line, i.e. the output layout is not the one we know how to merge.
///
/// `void test` is made `static`: the instrumenter gives every definition
/// internal linkage but leaves forward declarations alone, which would
/// otherwise produce conflicting declarations.
pub fn merge_yarpgen_sources(driver: &str, func: &str) -> Option<String> {
    let mut func_lines: Vec<&str> = func.split_inclusive('\n').collect();
    let include = func_lines.get(YARPGEN_INIT_INCLUDE_LINE)?;
    if include.trim_end_matches(['\n', '\r']) != YARPGEN_INIT_INCLUDE {
        return None;
    }
    func_lines.remove(YARPGEN_INIT_INCLUDE_LINE);

    let mut merged = String::with_capacity(driver.len() + func.len());
    merged.push_str(driver);
    if !driver.is_empty() && !driver.ends_with('\n') {
        merged.push('\n');
    }
    for line in func_lines {
        merged.push_str(line);
    }
    Some(merged.replace("void test", "static void test"))
}

impl<R: Rng + Send> ProgramGenerator for YarpgenGenerator<R> {
    fn name(&self) -> &'static str {
        "yarpgen"
    }

    fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    fn produce(&mut self) -> Result<String, GeneratorError> {
        retry_invocations("yarpgen", YARPGEN_MAX_FAILURES, || {
            let out_dir = tempfile::tempdir()?;
            let mut cmd = Command::new(&self.settings.executable);
            cmd.args(self.arguments(out_dir.path()));
            let result = self.runner.run(&mut cmd, None);
            if classify("yarpgen", result)?.is_none() {
                return Ok(Attempt::Failed);
            }

            let driver = fs::read_to_string(out_dir.path().join("driver.c"));
            let func = fs::read_to_string(out_dir.path().join("func.c"));
            let (driver, func) = match (driver, func) {
                (Ok(driver), Ok(func)) => (driver, func),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("YARPGen succeeded but its output is unreadable: {e}");
                    return Ok(Attempt::Failed);
                }
            };
            Ok(match merge_yarpgen_sources(&driver, &func) {
                Some(program) => Attempt::Program(program),
                None => {
                    warn!("YARPGen func.c lacks the expected init.h include, discarding");
                    Attempt::Failed
                }
            })
        })
    }
}

/// Instantiates the generator selected by `kind`.
pub fn build_generator(
    kind: GeneratorKind,
    settings: GeneratorSettings,
    rng: ChaCha8Rng,
) -> Box<dyn ProgramGenerator> {
    match kind {
        GeneratorKind::Csmith => Box::new(CsmithGenerator::new(settings, rng)),
        GeneratorKind::Yarpgen => Box::new(YarpgenGenerator::new(settings, rng)),
    }
}
