//! Runs discovery in worker processes and hands their cases to one consumer.
//!
//! Each worker gets its own process group, so suspending, resuming and
//! killing a worker also reaches the generator and compiler processes it
//! has spawned.

use crate::case::{Case, CaseError};
use crate::setting::Scenario;
use crate::worker::WORKER_ID_ENV;
use crossbeam_channel::{Receiver, Sender, unbounded};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        source: std::io::Error,
    },
    #[error("Failed to hand the scenario to worker {worker}: {source}")]
    Handoff {
        worker: usize,
        source: std::io::Error,
    },
    #[error("Failed to encode scenario: {0}")]
    Scenario(#[from] serde_json::Error),
    #[error("Every worker has exited")]
    AllWorkersExited,
    #[error("Failed to persist case: {0}")]
    Persist(#[from] CaseError),
    #[error("Failed to signal worker {worker}: {source}")]
    Signal { worker: usize, source: Errno },
    #[error("Search was terminated")]
    Terminated,
}

/// How to launch one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self, worker: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_ID_ENV, worker.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0);
        cmd
    }
}

enum WorkerEvent {
    Line { worker: usize, line: String },
    Closed { worker: usize },
}

struct WorkerHandle {
    child: Child,
    reader: Option<JoinHandle<()>>,
    /// Set once the process has been waited for; its pid may be reused after that.
    reaped: bool,
    stream_open: bool,
}

impl WorkerHandle {
    fn pgid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

/// A pool of worker processes searching the same scenario.
pub struct ParallelSearch {
    workers: Vec<WorkerHandle>,
    events: Receiver<WorkerEvent>,
    start_stop: bool,
    suspended: bool,
    delivered: u64,
    written: u64,
    terminated: bool,
}

impl ParallelSearch {
    /// Spawns `worker_count` workers, at least one, and sends each the
    /// scenario.
    ///
    /// With `start_stop`, workers are suspended whenever a case has been
    /// handed out and resumed on the following `next` call.
    pub fn start(
        command: &WorkerCommand,
        scenario: &Scenario,
        worker_count: usize,
        start_stop: bool,
    ) -> Result<Self, SearchError> {
        if worker_count == 0 {
            warn!("Worker count of 0 requested, starting 1 worker");
        }
        let worker_count = worker_count.max(1);
        let scenario_line = serde_json::to_string(scenario)?;
        let (sender, events) = unbounded();
        let mut search = Self {
            workers: Vec::with_capacity(worker_count),
            events,
            start_stop,
            suspended: false,
            delivered: 0,
            written: 0,
            terminated: false,
        };

        // Already spawned workers are cleaned up by `Drop` if a later one fails.
        for worker in 0..worker_count {
            let mut child = command
                .command(worker)
                .spawn()
                .map_err(|source| SearchError::Spawn { worker, source })?;
            let stdout = child.stdout.take();
            let stdin = child.stdin.take();
            search.workers.push(WorkerHandle {
                child,
                reader: None,
                reaped: false,
                stream_open: true,
            });

            if let Some(mut stdin) = stdin {
                writeln!(stdin, "{scenario_line}")
                    .and_then(|_| stdin.flush())
                    .map_err(|source| SearchError::Handoff { worker, source })?;
            }
            if let Some(stdout) = stdout {
                let reader = spawn_reader(worker, stdout, sender.clone());
                search.workers[worker].reader = Some(reader);
            }
            info!(worker, pid = search.workers[worker].child.id(), "Worker started");
        }
        Ok(search)
    }

    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers.iter().map(|w| w.child.id()).collect()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Cases handed out so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Blocks until some worker reports a case.
    pub fn next(&mut self) -> Result<Case, SearchError> {
        if self.terminated {
            return Err(SearchError::Terminated);
        }
        if self.suspended {
            self.resume()?;
        }

        loop {
            if self.workers.iter().all(|w| !w.stream_open) {
                return Err(SearchError::AllWorkersExited);
            }
            let event = self
                .events
                .recv()
                .map_err(|_| SearchError::AllWorkersExited)?;
            match event {
                WorkerEvent::Line { worker, line } => match Case::from_json(&line) {
                    Ok(case) => {
                        self.delivered += 1;
                        debug!(worker, delivered = self.delivered, "Received case");
                        if self.start_stop {
                            self.suspend()?;
                        }
                        return Ok(case);
                    }
                    Err(e) => warn!(worker, "Skipping malformed case record: {e}"),
                },
                WorkerEvent::Closed { worker } => self.note_closed(worker),
            }
        }
    }

    /// Like [`ParallelSearch::next`], then writes the case as
    /// `case_<counter>-<fingerprint>.tar` into `dir`.
    pub fn next_to_file(&mut self, dir: &Path) -> Result<PathBuf, SearchError> {
        let mut case = self.next()?;
        let path = dir.join(case.archive_name(self.written)?);
        case.path = Some(path.clone());
        case.to_file(&path)?;
        self.written += 1;
        info!(path = %path.display(), "Case written");
        Ok(path)
    }

    /// Stops every live worker with `SIGSTOP`.
    pub fn suspend(&mut self) -> Result<(), SearchError> {
        self.signal_all(Signal::SIGSTOP)?;
        self.suspended = true;
        Ok(())
    }

    /// Continues every live worker with `SIGCONT`.
    pub fn resume(&mut self) -> Result<(), SearchError> {
        self.signal_all(Signal::SIGCONT)?;
        self.suspended = false;
        Ok(())
    }

    /// Kills and reaps every worker and joins the reader threads.
    /// Calling it again does nothing.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        for (worker, handle) in self.workers.iter().enumerate() {
            if handle.reaped {
                continue;
            }
            for signal in [Signal::SIGCONT, Signal::SIGKILL] {
                if let Err(e) = send_signal(handle, signal) {
                    warn!(worker, ?signal, "Failed to signal worker: {e}");
                }
            }
        }

        for (worker, handle) in self.workers.iter_mut().enumerate() {
            if !handle.reaped {
                match handle.child.wait() {
                    Ok(status) => debug!(worker, %status, "Worker reaped"),
                    Err(e) => warn!(worker, "Failed to reap worker: {e}"),
                }
                handle.reaped = true;
            }
            if let Some(reader) = handle.reader.take() {
                if reader.join().is_err() {
                    warn!(worker, "Reader thread panicked");
                }
            }
        }
        self.suspended = false;
        info!(workers = self.workers.len(), "Search terminated");
    }

    fn signal_all(&mut self, signal: Signal) -> Result<(), SearchError> {
        for (worker, handle) in self.workers.iter().enumerate() {
            if handle.reaped {
                continue;
            }
            send_signal(handle, signal).map_err(|source| SearchError::Signal { worker, source })?;
        }
        Ok(())
    }

    fn note_closed(&mut self, worker: usize) {
        let handle = &mut self.workers[worker];
        handle.stream_open = false;
        match handle.child.try_wait() {
            Ok(Some(status)) => {
                handle.reaped = true;
                warn!(worker, %status, "Worker exited");
            }
            Ok(None) => warn!(worker, "Worker closed its output"),
            Err(e) => warn!(worker, "Worker closed its output, status unavailable: {e}"),
        }
    }
}

impl Drop for ParallelSearch {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// A worker that has already exited but not been reaped is not an error.
fn send_signal(handle: &WorkerHandle, signal: Signal) -> Result<(), Errno> {
    match killpg(handle.pgid(), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

fn spawn_reader(worker: usize, stdout: ChildStdout, sender: Sender<WorkerEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            match line {
                Ok(line) => {
                    if sender.send(WorkerEvent::Line { worker, line }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(worker, "Failed to read worker output: {e}");
                    break;
                }
            }
        }
        let _ = sender.send(WorkerEvent::Closed { worker });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setting::{CompilerSetting, OptLevel};
    use crate::test_support::write_script;
    use nix::sys::signal::kill;
    use std::fs;
    use std::time::Duration;

    fn scenario() -> Scenario {
        Scenario::new(
            vec![CompilerSetting::new("A", "trunk", OptLevel::O2)],
            vec![CompilerSetting::new("B", "trunk", OptLevel::O2)],
        )
    }

    fn sample_case_line() -> String {
        let scenario = scenario();
        Case::new(
            "int main(void) { return 0; }\n",
            "DCEMarker7_",
            scenario.target_settings[0].clone(),
            scenario.attacker_settings.clone(),
            scenario,
        )
        .to_json_line()
        .unwrap()
    }

    /// A worker script run through `/bin/sh`, with `$DIR` pointing at the
    /// test directory and `$DIR/case` holding one valid case record.
    struct Fixture {
        dir: tempfile::TempDir,
        command: WorkerCommand,
    }

    fn fixture(body: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("case"), format!("{}\n", sample_case_line())).unwrap();
        let script = write_script(
            dir.path(),
            "worker",
            &format!("DIR='{}'\n{body}", dir.path().display()),
        );
        let command = WorkerCommand::new("/bin/sh", vec![script.display().to_string()]);
        Fixture { dir, command }
    }

    const PRODUCER: &str = "\
read scenario
echo \"$scenario\" > \"$DIR/scenario.$DCESIFT_WORKER_ID\"
i=0
while true; do
  i=$((i+1))
  echo $i > \"$DIR/progress.$DCESIFT_WORKER_ID\"
  cat \"$DIR/case\"
  sleep 0.02
done
";

    fn progress(dir: &Path, workers: usize) -> Vec<String> {
        (0..workers)
            .map(|w| fs::read_to_string(dir.join(format!("progress.{w}"))).unwrap_or_default())
            .collect()
    }

    #[test]
    fn workers_receive_scenario_and_distinct_ids() {
        let fixture = fixture(PRODUCER);
        let mut search = ParallelSearch::start(&fixture.command, &scenario(), 2, false).unwrap();
        search.next().unwrap();
        search.next().unwrap();
        thread::sleep(Duration::from_millis(100));

        let expected = serde_json::to_string(&scenario()).unwrap();
        for worker in 0..2 {
            let received =
                fs::read_to_string(fixture.dir.path().join(format!("scenario.{worker}"))).unwrap();
            assert_eq!(received.trim_end(), expected);
        }
        search.terminate();
    }

    #[test]
    fn start_stop_freezes_workers_between_cases() {
        let fixture = fixture(PRODUCER);
        let mut search = ParallelSearch::start(&fixture.command, &scenario(), 2, true).unwrap();

        let case = search.next().unwrap();
        assert_eq!(case.marker, "DCEMarker7_");
        assert!(search.is_suspended());

        thread::sleep(Duration::from_millis(100));
        let frozen = progress(fixture.dir.path(), 2);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(progress(fixture.dir.path(), 2), frozen);

        search.next().unwrap();
        assert!(search.is_suspended());
        search.resume().unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_ne!(progress(fixture.dir.path(), 2), frozen);
        assert_eq!(search.delivered(), 2);
    }

    #[test]
    fn without_start_stop_workers_keep_running() {
        let fixture = fixture(PRODUCER);
        let mut search = ParallelSearch::start(&fixture.command, &scenario(), 1, false).unwrap();
        search.next().unwrap();
        assert!(!search.is_suspended());

        let before = progress(fixture.dir.path(), 1);
        thread::sleep(Duration::from_millis(300));
        assert_ne!(progress(fixture.dir.path(), 1), before);
    }

    #[test]
    fn terminate_reaps_every_worker_and_is_idempotent() {
        let fixture = fixture(PRODUCER);
        let mut search = ParallelSearch::start(&fixture.command, &scenario(), 3, true).unwrap();
        search.next().unwrap();
        let pids = search.worker_pids();
        assert_eq!(pids.len(), 3);

        search.terminate();
        for pid in pids {
            assert!(kill(Pid::from_raw(pid as i32), None).is_err(), "pid {pid} still exists");
        }
        search.terminate();
        assert!(matches!(search.next(), Err(SearchError::Terminated)));
    }

    #[test]
    fn reports_when_all_workers_have_exited() {
        let fixture = fixture("read scenario\nexit 3\n");
        let mut search = ParallelSearch::start(&fixture.command, &scenario(), 2, false).unwrap();
        assert!(matches!(search.next(), Err(SearchError::AllWorkersExited)));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let fixture = fixture("read scenario\necho 'not a case'\ncat \"$DIR/case\"\n");
        let mut search = ParallelSearch::start(&fixture.command, &scenario(), 1, false).unwrap();

        let case = search.next().unwrap();
        assert_eq!(case.marker, "DCEMarker7_");
        assert!(matches!(search.next(), Err(SearchError::AllWorkersExited)));
    }

    #[test]
    fn next_to_file_names_archives_by_counter_and_fingerprint() {
        let fixture = fixture(PRODUCER);
        let out = tempfile::tempdir().unwrap();
        let mut search = ParallelSearch::start(&fixture.command, &scenario(), 1, true).unwrap();

        let first = search.next_to_file(out.path()).unwrap();
        let second = search.next_to_file(out.path()).unwrap();
        search.terminate();

        let fingerprint = Case::from_json(&sample_case_line()).unwrap().fingerprint().unwrap();
        assert_eq!(
            first.file_name().unwrap().to_str().unwrap(),
            format!("case_00000000-{fingerprint:019}.tar")
        );
        assert_eq!(
            second.file_name().unwrap().to_str().unwrap(),
            format!("case_00000001-{fingerprint:019}.tar")
        );

        let stored = Case::from_file(&first).unwrap();
        assert_eq!(stored.marker, "DCEMarker7_");
        assert_eq!(stored.path.as_deref(), Some(first.as_path()));
    }

    #[test]
    fn zero_workers_start_one() {
        let fixture = fixture(PRODUCER);
        let mut search = ParallelSearch::start(&fixture.command, &scenario(), 0, false).unwrap();
        assert_eq!(search.worker_pids().len(), 1);
        assert_eq!(search.next().unwrap().marker, "DCEMarker7_");
        search.terminate();
    }

    #[test]
    fn spawn_failure_is_reported() {
        let command = WorkerCommand::new("/nonexistent/dcesift-worker", Vec::new());
        assert!(matches!(
            ParallelSearch::start(&command, &scenario(), 1, false),
            Err(SearchError::Spawn { worker: 0, .. })
        ));
    }
}
