// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{RecordError, EXIT_HOST_FAILURE, EXIT_INTERRUPTED},
    phase::{Direction, Phase},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Skipped,
    Failed,
}

/// Why a phase did not act on a host.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The host was already in the state the phase produces.
    AlreadyInState,
    NoInverse,
    /// The host failed an earlier phase of this run.
    Excluded { after: Phase },
    /// Every host the phase applies to has failed or is out of scope.
    NoEligibleHosts,
    /// The run was interrupted before the operation started.
    Interrupted,
    /// The host completed this phase in the run being resumed.
    Resumed { run_id: u64 },
}

/// The result of one phase on one host. Phase-wide events (such as a phase with no eligible
/// hosts) carry no host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PhaseResult {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    pub timestamp: DateTime<Utc>,
}

impl PhaseResult {
    pub fn new(phase: Phase, host: Option<String>, outcome: Outcome, message: Option<String>) -> Self {
        PhaseResult {
            phase,
            host,
            outcome,
            message,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn skipped(phase: Phase, host: Option<String>, reason: SkipReason, message: String) -> Self {
        Self::new(phase, host, Outcome::Skipped, Some(message)).because(reason)
    }

    pub fn because(mut self, reason: SkipReason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Whether this result shows the host in the phase's target state afterwards.
    pub fn completes_phase(&self) -> bool {
        match self.outcome {
            Outcome::Succeeded => true,
            Outcome::Skipped => matches!(
                self.reason,
                Some(SkipReason::AlreadyInState | SkipReason::NoInverse | SkipReason::Resumed { .. })
            ),
            Outcome::Failed => false,
        }
    }

    fn describe(&self) -> String {
        let mut line = format!("{} {}", self.phase, self.host.as_deref().unwrap_or("(all)"));
        if let Some(msg) = &self.message {
            line.push_str(": ");
            line.push_str(msg);
        }
        line
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    /// An operator interrupt stopped the run before every phase was attempted.
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed => EXIT_HOST_FAILURE,
            RunOutcome::Interrupted => EXIT_INTERRUPTED,
        }
    }
}

/// The first entry of every run record file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunHeader {
    pub run_id: u64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub dry_run: bool,
    pub phases: Vec<Phase>,
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<u64>,
}

/// The terminal entry of a run record file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: u64,
    pub timestamp: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failed_hosts: Vec<String>,
}

/// A single line in a run record file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Entry {
    Start(RunHeader),
    Phase(PhaseResult),
    Summary(RunSummary),
}

/// The complete account of one run, in the order results were produced.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: u64,
    pub direction: Direction,
    pub dry_run: bool,
    pub phases: Vec<Phase>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub results: Vec<PhaseResult>,
    pub outcome: RunOutcome,
}

impl RunRecord {
    pub fn results_for(&self, phase: Phase) -> impl Iterator<Item = &PhaseResult> {
        self.results.iter().filter(move |r| r.phase == phase)
    }

    /// The result of `phase` on `host`, if the phase reached that host.
    pub fn result(&self, phase: Phase, host: &str) -> Option<&PhaseResult> {
        self.results_for(phase)
            .find(|r| r.host.as_deref() == Some(host))
    }

    /// The (phase, host) pairs this run covered, in order.
    pub fn coverage(&self) -> Vec<(Phase, Option<String>)> {
        self.results
            .iter()
            .map(|r| (r.phase, r.host.clone()))
            .collect()
    }

    pub fn failed_hosts(&self) -> BTreeSet<String> {
        self.results
            .iter()
            .filter(|r| r.outcome == Outcome::Failed)
            .filter_map(|r| r.host.clone())
            .collect()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

fn record_path(dir: &Path, run_id: u64) -> PathBuf {
    dir.join(format!("run-{run_id:06}.jsonl"))
}

fn parse_run_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("run-")?
        .strip_suffix(".jsonl")?
        .parse()
        .ok()
}

/// The highest run id recorded in `dir`, if any.
fn latest_run_id(dir: &Path) -> io::Result<Option<u64>> {
    let mut latest = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_run_id) {
            latest = latest.max(Some(id));
        }
    }
    Ok(latest)
}

/// A run-scoped, append-only recorder.
///
/// The recorder is shared between every concurrent host operation of a run; each `append` takes
/// the lock, writes one line to the record file, and adds the result to the in-memory record.
/// Record files are never rewritten, so a partial run leaves an accurate account behind.
#[derive(Debug)]
pub struct RunRecorder {
    run_id: u64,
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
    header: Mutex<Option<RunHeader>>,
    results: Mutex<Vec<PhaseResult>>,
    write_failures: AtomicUsize,
}

impl RunRecorder {
    /// Allocate the next run id in `dir` and open its record file.
    ///
    /// Ids are allocated by creating the file exclusively, so two deployments sharing a record
    /// directory never write to the same record.
    pub fn create(dir: &Path) -> Result<Self, RecordError> {
        let io_err = |source| RecordError::Io {
            path: dir.to_path_buf(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;

        let mut run_id = latest_run_id(dir).map_err(io_err)?.unwrap_or(0) + 1;
        loop {
            let path = record_path(dir, run_id);
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => {
                    return Ok(Self::with_sink(run_id, Some((path, file))));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => run_id += 1,
                Err(source) => return Err(RecordError::Io { path, source }),
            }
        }
    }

    /// A recorder that keeps results in memory only.
    pub fn in_memory(run_id: u64) -> Self {
        Self::with_sink(run_id, None)
    }

    fn with_sink(run_id: u64, sink: Option<(PathBuf, File)>) -> Self {
        let (path, file) = match sink {
            Some((path, file)) => (Some(path), Some(Mutex::new(file))),
            None => (None, None),
        };
        RunRecorder {
            run_id,
            path,
            file,
            header: Mutex::new(None),
            results: Mutex::new(Vec::new()),
            write_failures: AtomicUsize::new(0),
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Path of the record file, for recorders backed by one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of entries that could not be written to the record file.
    pub fn write_failures(&self) -> usize {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn begin(&self, header: RunHeader) {
        self.write(&Entry::Start(header.clone()));
        *self.header.lock().unwrap() = Some(header);
    }

    pub fn append(&self, result: PhaseResult) {
        match result.outcome {
            Outcome::Failed => log::warn!("run {}: failed {}", self.run_id, result.describe()),
            Outcome::Succeeded => log::info!("run {}: done {}", self.run_id, result.describe()),
            Outcome::Skipped => log::info!("run {}: skipped {}", self.run_id, result.describe()),
        }

        // Hold the results lock across the write so file order matches in-memory order.
        let mut results = self.results.lock().unwrap();
        self.write(&Entry::Phase(result.clone()));
        results.push(result);
    }

    /// Write the terminal summary and return the finished record.
    pub fn finish(&self, outcome: RunOutcome) -> RunRecord {
        let header = self.header.lock().unwrap().clone();
        let results = self.results.lock().unwrap().clone();

        let (direction, dry_run, phases, started) = match header {
            Some(h) => (h.direction, h.dry_run, h.phases, h.timestamp),
            None => (Direction::Forward, false, Vec::new(), Utc::now()),
        };

        let record = RunRecord {
            run_id: self.run_id,
            direction,
            dry_run,
            phases,
            started,
            finished: Utc::now(),
            results,
            outcome,
        };

        self.write(&Entry::Summary(RunSummary {
            run_id: self.run_id,
            timestamp: record.finished,
            outcome,
            succeeded: record.count(Outcome::Succeeded),
            skipped: record.count(Outcome::Skipped),
            failed: record.count(Outcome::Failed),
            failed_hosts: record.failed_hosts().into_iter().collect(),
        }));

        record
    }

    /// Writes a single entry to the record file.
    fn write(&self, entry: &Entry) {
        let Some(file) = &self.file else {
            return;
        };

        let res = serde_json::to_string(entry)
            .map_err(RecordError::from)
            .and_then(|line| {
                file.lock()
                    .unwrap()
                    .write_all(&[line.as_bytes(), b"\n"].concat())
                    .map_err(|source| RecordError::Io {
                        path: self.path.clone().unwrap_or_default(),
                        source,
                    })
            });

        if let Err(e) = res {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("failed to append to run record: {e}");
        }
    }
}

/// A run record read back from disk, for display and for resuming.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    pub header: Option<RunHeader>,
    pub results: Vec<PhaseResult>,
    pub summary: Option<RunSummary>,
}

impl RunLog {
    /// Load the record of `run_id` from the record directory `dir`.
    pub fn load(dir: &Path, run_id: u64) -> Result<Self, RecordError> {
        let path = record_path(dir, run_id);
        if !path.exists() {
            return Err(RecordError::MissingRun {
                run_id,
                dir: dir.to_path_buf(),
            });
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, RecordError> {
        let file = File::open(path).map_err(|source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut log = RunLog::default();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| RecordError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|source| RecordError::Malformed {
                path: path.to_path_buf(),
                line: i + 1,
                source,
            })?;
            match entry {
                Entry::Start(header) => log.header = Some(header),
                Entry::Phase(result) => log.results.push(result),
                Entry::Summary(summary) => log.summary = Some(summary),
            }
        }
        Ok(log)
    }

    pub fn run_id(&self) -> Option<u64> {
        self.header.as_ref().map(|h| h.run_id)
    }

    /// Whether `host` ended this run with `phase` in its target state.
    pub fn completed(&self, phase: Phase, host: &str) -> bool {
        self.results
            .iter()
            .any(|r| r.phase == phase && r.host.as_deref() == Some(host) && r.completes_phase())
    }
}
