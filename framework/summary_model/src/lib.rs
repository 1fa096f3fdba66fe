use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha3::Digest;
use std::collections::HashMap;
use std::io::{BufRead, Read, Write};
use std::path::Path;

/// Summary of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// The unique run id
    ///
    /// Chosen by the runner. Unique for each run.
    pub run_id: String,
    /// The test type that was run, for example `max_perf`
    pub test_type: String,
    /// The test id given on the command line
    pub test_id: i64,
    /// The test tag given on the command line
    pub test_tag: String,
    /// The time the run started
    ///
    /// This is a Unix timestamp in seconds.
    pub started_at: i64,
    /// The time the last step finished, as a Unix timestamp in seconds
    ///
    /// Not set if the run was aborted.
    pub finished_at: Option<i64>,
    /// The planned runtime of the test plan in seconds, including impact windows
    pub planned_runtime: u64,
    /// The workloads that were replayed
    pub workloads: Vec<WorkloadSummary>,
    /// The steps that ran, in order
    pub steps: Vec<StepSummary>,
    /// Selected settings of the run
    ///
    /// These are the plan and policy values that shape the load, such as the base speed and the
    /// speed check threshold. They take part in the [RunSummary::fingerprint].
    pub settings: HashMap<String, String>,
    /// The version of pcap-blaster used for this run
    pub blaster_version: String,
}

/// A workload as it was configured for the run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadSummary {
    pub id: usize,
    pub file: String,
    pub interface: String,
    pub percentage: f64,
    /// The resolved unique IP loop count, 0 if unique IP looping was off
    pub loop_count: u64,
    pub netmap: bool,
}

/// A completed step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSummary {
    pub number: u32,
    /// Human readable phase, for example `load` or `spike period of cycle 2`
    pub phase: String,
    pub load_percent: f64,
    pub duration_s: u64,
    pub started_at: i64,
    pub finished_at: i64,
    pub workers: Vec<WorkerSummary>,
}

/// What one replay worker did during a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSummary {
    pub workload_id: usize,
    pub load_percent: f64,
    pub target_speed: f64,
    pub loops: u64,
    /// Number of restarts caused by an abnormal rate
    pub restarts: u32,
    pub outcome: WorkerOutcome,
}

/// How a replay worker ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// The replay process exited by itself
    Finished,
    /// The replay process outlived its duration and was stopped
    HardStopped,
    /// The replay process reported a fatal error
    FatalTelemetry { line: String },
    /// The replay process could not be run
    SpawnFailed { error: String },
    /// The replay ran but could not be supervised, e.g. its stats file could not be written
    Failed { error: String },
}

impl WorkerOutcome {
    /// Whether the worker ended cleanly, with a closing timestamp in its stats file
    pub fn is_clean(&self) -> bool {
        matches!(self, WorkerOutcome::Finished | WorkerOutcome::HardStopped)
    }
}

impl RunSummary {
    /// Create a new run summary
    pub fn new(
        run_id: String,
        test_type: String,
        test_id: i64,
        test_tag: String,
        started_at: i64,
        planned_runtime: u64,
        workloads: Vec<WorkloadSummary>,
        blaster_version: String,
    ) -> Self {
        Self {
            run_id,
            test_type,
            test_id,
            test_tag,
            started_at,
            finished_at: None,
            planned_runtime,
            workloads,
            steps: Vec::new(),
            settings: HashMap::with_capacity(0),
            blaster_version,
        }
    }

    /// Record a completed step
    pub fn add_step(&mut self, step: StepSummary) {
        self.steps.push(step);
    }

    /// Set the time the run finished
    pub fn set_finished_at(&mut self, finished_at: i64) {
        self.finished_at = Some(finished_at);
    }

    /// Add a setting
    pub fn add_setting(&mut self, key: impl Into<String>, value: impl ToString) {
        self.settings.insert(key.into(), value.to_string());
    }

    /// Total number of abnormal rate restarts across all steps
    pub fn total_restarts(&self) -> u32 {
        self.steps
            .iter()
            .flat_map(|s| s.workers.iter())
            .map(|w| w.restarts)
            .sum()
    }

    /// Compute a fingerprint for this run summary
    ///
    /// The fingerprint is intended to uniquely identify the configuration used to run the test.
    /// It uses the
    ///     - Test type
    ///     - Planned runtime
    ///     - Workloads
    ///     - Settings
    ///     - pcap-blaster version
    ///
    /// The fingerprint is computed using [sha3::Sha3_256].
    pub fn fingerprint(&self) -> String {
        let mut hasher = sha3::Sha3_256::new();
        Digest::update(&mut hasher, self.test_type.as_bytes());
        Digest::update(&mut hasher, self.planned_runtime.to_le_bytes());
        self.workloads
            .iter()
            .sorted_by_key(|w| w.id)
            .for_each(|w| {
                Digest::update(&mut hasher, w.file.as_bytes());
                Digest::update(&mut hasher, w.interface.as_bytes());
                Digest::update(&mut hasher, w.percentage.to_le_bytes());
                Digest::update(&mut hasher, w.loop_count.to_le_bytes());
            });
        self.settings
            .iter()
            .sorted_by_key(|(k, _)| k.to_owned())
            .for_each(|(k, v)| {
                Digest::update(&mut hasher, k.as_bytes());
                Digest::update(&mut hasher, v.as_bytes());
            });
        Digest::update(&mut hasher, self.blaster_version.as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

/// Append the run summary to a file
///
/// The summary will be serialized to JSON and output as a single line followed by a newline. The
/// recommended file extension is `.jsonl`.
pub fn append_run_summary(run_summary: &RunSummary, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    store_run_summary(run_summary, &mut file)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Serialize the run summary to a writer
pub fn store_run_summary<W: Write>(run_summary: &RunSummary, writer: &mut W) -> anyhow::Result<()> {
    serde_json::to_writer(writer, run_summary)?;
    Ok(())
}

/// Load a run summary from a reader
pub fn load_run_summary<R: Read>(reader: R) -> anyhow::Result<RunSummary> {
    let reader = std::io::BufReader::new(reader);
    let run_summary: RunSummary = serde_json::from_reader(reader)?;
    Ok(run_summary)
}

/// Load run summaries from a file
///
/// The file should contain one JSON object per line. This is the format produced by
/// [append_run_summary].
pub fn load_summary_runs(path: impl AsRef<Path>) -> anyhow::Result<Vec<RunSummary>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut runs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let run: RunSummary = serde_json::from_str(&line)?;
        runs.push(run);
    }
    Ok(runs)
}
