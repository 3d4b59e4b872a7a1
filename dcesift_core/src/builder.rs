use crate::config::ToolchainEntry;
use crate::process::{CommandRunner, RunError};
use crate::setting::CompilerSetting;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

/// Markers whose calls survive compilation under one setting.
pub type AliveMarkerSet = BTreeSet<String>;

/// A compiler could not turn the program into assembly.
///
/// Always recoverable for the search: the candidate (or tentative case)
/// that triggered it is simply dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("{setting} failed to compile: {detail}")]
    Failed { setting: String, detail: String },
    #[error("{setting} timed out")]
    Timeout { setting: String },
}

/// Determines which instrumentation markers a compiler setting keeps.
pub trait Builder: Send + Sync {
    fn find_alive_markers(
        &self,
        code: &str,
        setting: &CompilerSetting,
        marker_prefix: &str,
    ) -> Result<AliveMarkerSet, CompileError>;
}

impl<B: Builder + ?Sized> Builder for std::sync::Arc<B> {
    fn find_alive_markers(
        &self,
        code: &str,
        setting: &CompilerSetting,
        marker_prefix: &str,
    ) -> Result<AliveMarkerSet, CompileError> {
        (**self).find_alive_markers(code, setting, marker_prefix)
    }
}

/// Finds `<prefix><n>_` operands of call, jump and branch instructions.
pub struct MarkerScanner {
    prefix: String,
    pattern: Regex,
}

impl MarkerScanner {
    pub fn new(marker_prefix: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"\b(?:call|jmp|bl|b)\w*\s.*?{}([0-9]+)_",
            regex::escape(marker_prefix)
        ))?;
        Ok(Self {
            prefix: marker_prefix.to_string(),
            pattern,
        })
    }

    pub fn scan(&self, asm: &str) -> AliveMarkerSet {
        asm.lines()
            .filter_map(|line| self.pattern.captures(line.trim()))
            .map(|caps| format!("{}{}_", self.prefix, &caps[1]))
            .collect()
    }
}

/// Resolves the executable behind a `(compiler, version)` pair.
#[derive(Debug, Clone, Default)]
pub struct Toolchains {
    executables: HashMap<(String, String), PathBuf>,
}

impl Toolchains {
    pub fn new(entries: &[ToolchainEntry]) -> Self {
        let executables = entries
            .iter()
            .map(|e| ((e.name.clone(), e.version.clone()), e.executable.clone()))
            .collect();
        Self { executables }
    }

    /// Falls back to the bare compiler name, i.e. a `$PATH` lookup.
    pub fn executable(&self, setting: &CompilerSetting) -> PathBuf {
        self.executables
            .get(&(setting.compiler.clone(), setting.version.clone()))
            .cloned()
            .unwrap_or_else(|| PathBuf::from(&setting.compiler))
    }
}

/// Compiles to assembly and reads alive markers off the call sites.
#[derive(Debug, Clone)]
pub struct AsmBuilder {
    toolchains: Toolchains,
    runner: CommandRunner,
}

impl AsmBuilder {
    pub fn new(toolchains: Toolchains, compile_timeout_ms: u64) -> Self {
        Self {
            toolchains,
            runner: CommandRunner::with_timeout_ms(compile_timeout_ms),
        }
    }

    pub fn compile_to_asm(&self, code: &str, setting: &CompilerSetting) -> Result<String, CompileError> {
        let mut cmd = Command::new(self.toolchains.executable(setting));
        cmd.args(setting.command_line_flags())
            .args(["-S", "-o", "-", "-x", "c", "-"]);

        let output = self
            .runner
            .run(&mut cmd, Some(code.as_bytes()))
            .map_err(|e| match e {
                RunError::Timeout { .. } => CompileError::Timeout {
                    setting: setting.to_string(),
                },
                other => CompileError::Failed {
                    setting: setting.to_string(),
                    detail: other.to_string(),
                },
            })?;
        if !output.success() {
            return Err(CompileError::Failed {
                setting: setting.to_string(),
                detail: format!("{}: {}", output.describe_exit(), output.stderr_lossy().trim()),
            });
        }
        Ok(output.stdout_lossy())
    }
}

impl Builder for AsmBuilder {
    fn find_alive_markers(
        &self,
        code: &str,
        setting: &CompilerSetting,
        marker_prefix: &str,
    ) -> Result<AliveMarkerSet, CompileError> {
        let scanner = MarkerScanner::new(marker_prefix).map_err(|e| CompileError::Failed {
            setting: setting.to_string(),
            detail: format!("unusable marker prefix {marker_prefix:?}: {e}"),
        })?;
        let asm = self.compile_to_asm(code, setting)?;
        Ok(scanner.scan(&asm))
    }
}
