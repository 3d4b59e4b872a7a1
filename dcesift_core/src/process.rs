use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// How often a running child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Failure to obtain an exit status from an external tool.
///
/// A tool that runs to completion with a non-zero exit code is *not* a
/// `RunError`; callers inspect [`ProcessOutput`] for that.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to spawn command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Command '{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("Error waiting for command '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::Timeout { .. })
    }
}

#[derive(Debug, Default, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Human readable description of how the process ended.
    pub fn describe_exit(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("Exited with code {code}"),
            (None, Some(signal)) => format!("Terminated by signal {signal}"),
            (None, None) => "Exited abnormally".to_string(),
        }
    }

    fn from_status(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            stdout,
            stderr,
            exit_code: status.code(),
            signal,
        }
    }
}

/// Runs external tools with captured output and an optional wall-clock limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner {
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// A timeout of `0` disables the limit.
    pub fn with_timeout_ms(timeout_ms: u64) -> Self {
        if timeout_ms == 0 {
            Self::new(None)
        } else {
            Self::new(Some(Duration::from_millis(timeout_ms)))
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Spawns `cmd`, optionally feeds `stdin_data`, and waits for it.
    ///
    /// stdout and stderr are drained on helper threads so a chatty tool
    /// cannot block on a full pipe while we poll for its exit.
    pub fn run(
        &self,
        cmd: &mut Command,
        stdin_data: Option<&[u8]>,
    ) -> Result<ProcessOutput, RunError> {
        let program = cmd.get_program().to_string_lossy().into_owned();

        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdin_writer = match (stdin_data, child.stdin.take()) {
            (Some(data), Some(mut stdin)) => {
                let data = data.to_vec();
                Some(thread::spawn(move || {
                    // A tool that exits early closes the pipe; that is not our error.
                    let _ = stdin.write_all(&data);
                }))
            }
            _ => None,
        };
        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let status = self.wait_with_timeout(&mut child, &program)?;

        if let Some(handle) = stdin_writer {
            let _ = handle.join();
        }
        let stdout = collect(stdout_reader);
        let stderr = collect(stderr_reader);

        Ok(ProcessOutput::from_status(status, stdout, stderr))
    }

    fn wait_with_timeout(&self, child: &mut Child, program: &str) -> Result<ExitStatus, RunError> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if let Some(timeout) = self.timeout {
                        if start_time.elapsed() > timeout {
                            debug!(program, ?timeout, "Command timed out, killing");
                            if let Err(e) = child.kill() {
                                warn!(program, "Failed to kill timed-out process: {e}");
                            }
                            let _ = child.wait();
                            return Err(RunError::Timeout {
                                program: program.to_string(),
                                timeout,
                            });
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(RunError::Wait {
                        program: program.to_string(),
                        source,
                    });
                }
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}
