//! Runs tcpreplay for one workload during one step, keeping it at the right rate.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blaster_core::prelude::{FatalTelemetryError, RunPolicy, SpeedUnit, Step, TestPlan, Workload};
use blaster_summary_model::{WorkerOutcome, WorkerSummary};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStderr;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::child::{OutputLines, Privilege, SupervisedChild};
use crate::telemetry::{SpeedCheck, Verdict};
use crate::types::BlasterResult;

/// How long a replay may run past its duration before it is stopped.
const HARD_STOP_GRACE: Duration = Duration::from_secs(5);
/// Pause between stopping an unstable replay and starting it again.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);
/// How long to wait for the error stream to close once the process is gone.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to replay one workload for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayTask {
    pub step: u32,
    pub workload_id: usize,
    pub file: PathBuf,
    pub interface: String,
    pub load_percent: f64,
    pub target_speed: f64,
    pub unit: SpeedUnit,
    pub loops: u64,
    /// Step duration plus the impact window.
    pub duration_s: u64,
    pub preload: bool,
    pub netmap: bool,
    pub stats_file: PathBuf,
    pub err_file: PathBuf,
}

impl ReplayTask {
    pub fn new(step: &Step, workload: &Workload, plan: &TestPlan) -> Self {
        let load_percent = step.load_percent_for(workload.id);
        let name = format!(
            "step_{}__file_num_{}__{}.log",
            step.number,
            workload.id,
            workload.file_name()
        );

        Self {
            step: step.number,
            workload_id: workload.id,
            file: workload.file.clone(),
            interface: workload.interface.clone(),
            load_percent,
            target_speed: plan.base_speed.scaled(load_percent, workload.percentage),
            unit: plan.base_speed.unit,
            loops: workload.loops_for_step(load_percent),
            duration_s: step.duration_s + plan.impact_s,
            preload: workload.preload_in_ram,
            netmap: workload.netmap,
            stats_file: plan.output_dir.join(format!("stats__{name}")),
            err_file: plan.output_dir.join(format!("err__{name}")),
        }
    }

    /// Arguments for tcpreplay, the capture file last.
    pub fn args(&self, policy: &RunPolicy) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.interface.clone(),
            "--stats=1".to_string(),
            "--loop=0".to_string(),
            format!("--duration={}", self.duration_s),
        ];
        if self.preload {
            args.push("--preload-pcap".to_string());
        }
        if self.loops > 0 {
            args.push("--unique-ip".to_string());
            args.push(format!("--unique-ip-loops={}", self.loops));
        }
        args.push(match self.unit {
            SpeedUnit::Pps => format!("--pps={}", self.target_speed),
            SpeedUnit::Mbps => format!("--mbps={}", self.target_speed),
        });
        if self.netmap {
            args.push("--netmap".to_string());
            args.push("--nm-delay=2".to_string());
        }
        args.extend(policy.extra_args.iter().flat_map(|arg| arg.to_args()));
        args.push(self.file.display().to_string());
        args
    }

    fn summary(&self, restarts: u32, outcome: WorkerOutcome) -> WorkerSummary {
        WorkerSummary {
            workload_id: self.workload_id,
            load_percent: self.load_percent,
            target_speed: self.target_speed,
            loops: self.loops,
            restarts,
            outcome,
        }
    }
}

/// How a single tcpreplay process ended.
#[derive(Debug, PartialEq)]
enum Attempt {
    Exited,
    HardStopped,
    Unstable { rate: f64 },
    Fatal { line: String },
}

/// Why an attempt could not be carried through.
#[derive(Debug)]
enum AttemptError {
    /// tcpreplay could not be started.
    Spawn(anyhow::Error),
    /// tcpreplay started, but its output could not be recorded or the process controlled.
    Supervise(anyhow::Error),
}

impl From<anyhow::Error> for AttemptError {
    fn from(e: anyhow::Error) -> Self {
        AttemptError::Supervise(e)
    }
}

/// Supervises the tcpreplay process for one [ReplayTask].
///
/// The process is restarted whenever its reported rate is abnormal, and stopped once it runs past
/// its duration plus a grace period, counted from the first start. Every process start appends the
/// current Unix time to the stats file, and a clean finish appends a closing one.
pub struct ReplayWorker {
    task: ReplayTask,
    policy: Arc<RunPolicy>,
    binary: Arc<PathBuf>,
}

impl ReplayWorker {
    pub fn new(task: ReplayTask, policy: Arc<RunPolicy>, binary: Arc<PathBuf>) -> Self {
        Self {
            task,
            policy,
            binary,
        }
    }

    pub async fn run(self) -> WorkerSummary {
        let task = &self.task;
        let mut restarts = 0;

        let mut stats = match open_append(&task.stats_file).await {
            Ok(stats) => stats,
            Err(e) => {
                log::error!("Step {}: {e:?}", task.step);
                return task.summary(restarts, WorkerOutcome::Failed {
                    error: format!("{e:#}"),
                });
            }
        };

        let started = Instant::now();
        let deadline = started + Duration::from_secs(task.duration_s) + HARD_STOP_GRACE;
        let mut speed_check = self.policy.speed_check.then(|| {
            SpeedCheck::new(
                task.target_speed,
                task.unit,
                &self.policy,
                task.netmap,
                started.into_std(),
            )
        });

        log::info!(
            "Step {}: replaying {} on {} at {} {} with {} unique IP loops",
            task.step,
            task.file.display(),
            task.interface,
            task.target_speed,
            task.unit.label(),
            task.loops
        );

        let outcome = loop {
            match self.attempt(&mut stats, speed_check.as_mut(), deadline).await {
                Ok(Attempt::Unstable { rate }) => {
                    restarts += 1;
                    log::warn!(
                        "Step {}: abnormal rate {rate} {} for {} (target {}), restarting",
                        task.step,
                        task.unit.label(),
                        task.file.display(),
                        task.target_speed
                    );
                    tokio::time::sleep_until((Instant::now() + RESTART_BACKOFF).min(deadline)).await;
                    if Instant::now() >= deadline {
                        break WorkerOutcome::HardStopped;
                    }
                    if let Some(check) = speed_check.as_mut() {
                        check.restart();
                    }
                }
                Ok(Attempt::Exited) => break WorkerOutcome::Finished,
                Ok(Attempt::HardStopped) => {
                    log::info!(
                        "Step {}: stopped {} after {}s",
                        task.step,
                        task.file.display(),
                        started.elapsed().as_secs()
                    );
                    break WorkerOutcome::HardStopped;
                }
                Ok(Attempt::Fatal { line }) => {
                    log::error!(
                        "Step {}: tcpreplay failed for {}: {line}",
                        task.step,
                        task.file.display()
                    );
                    break WorkerOutcome::FatalTelemetry { line };
                }
                Err(AttemptError::Spawn(e)) => {
                    log::error!("Step {}: {e:?}", task.step);
                    break WorkerOutcome::SpawnFailed {
                        error: format!("{e:#}"),
                    };
                }
                Err(AttemptError::Supervise(e)) => {
                    log::error!("Step {}: {e:?}", task.step);
                    break WorkerOutcome::Failed {
                        error: format!("{e:#}"),
                    };
                }
            }
        };

        if outcome.is_clean() {
            if let Err(e) = write_epoch(&mut stats).await {
                log::error!(
                    "Failed to close stats file {}: {e:?}",
                    task.stats_file.display()
                );
            }
        }

        task.summary(restarts, outcome)
    }

    async fn attempt(
        &self,
        stats: &mut File,
        mut speed_check: Option<&mut SpeedCheck>,
        deadline: Instant,
    ) -> Result<Attempt, AttemptError> {
        let task = &self.task;
        let privilege = if self.policy.sudo {
            Privilege::Sudo {
                password: self.policy.sudo_password.clone(),
            }
        } else {
            Privilege::User
        };

        let mut child = SupervisedChild::spawn(&self.binary, &task.args(&self.policy), &privilege)
            .await
            .with_context(|| format!("Failed to start {}", self.binary.display()))
            .map_err(AttemptError::Spawn)?;
        let spawned = Instant::now();
        write_epoch(stats)
            .await
            .with_context(|| format!("Failed to write {}", task.stats_file.display()))?;

        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let stderr = child
            .take_stderr()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, task.err_file.clone(), fatal_tx)));
        let mut stdout = child
            .take_stdout()
            .context("tcpreplay standard output is not available")?;

        let hard_stop = tokio::time::sleep_until(deadline);
        tokio::pin!(hard_stop);

        let mut attempt = loop {
            tokio::select! {
                line = stdout.next_line() => match line {
                    Ok(Some(line)) => {
                        append_line(stats, &line)
                            .await
                            .with_context(|| format!("Failed to write {}", task.stats_file.display()))?;

                        let verdict = match speed_check.as_deref_mut() {
                            Some(check) => check.observe(&line, spawned.elapsed(), Instant::now().into_std()),
                            None => Verdict::Skipped,
                        };
                        match verdict {
                            Verdict::Unstable { rate } => {
                                child.terminate().await.context("Failed to stop tcpreplay")?;
                                break Attempt::Unstable { rate };
                            }
                            Verdict::Stable { rate } => {
                                log::debug!("Step {}: rate {rate} for {} is stable", task.step, task.file.display());
                            }
                            Verdict::Skipped => {}
                        }
                    }
                    Ok(None) => break Attempt::Exited,
                    Err(e) => {
                        log::warn!("Step {}: failed to read tcpreplay output: {e}", task.step);
                        break Attempt::Exited;
                    }
                },
                Some(line) = fatal_rx.recv() => {
                    child.terminate().await.context("Failed to stop tcpreplay")?;
                    break Attempt::Fatal { line };
                }
                _ = &mut hard_stop => {
                    child.terminate().await.context("Failed to stop tcpreplay")?;
                    break Attempt::HardStopped;
                }
            }
        };

        // Closing its output does not end the process, the deadline still applies until it exits.
        if attempt == Attempt::Exited
            && tokio::time::timeout_at(deadline, child.wait()).await.is_err()
        {
            child.terminate().await.context("Failed to stop tcpreplay")?;
            attempt = Attempt::HardStopped;
        }

        let status = child.wait().await.context("Failed to wait for tcpreplay")?;
        log::debug!("Step {}: tcpreplay for {} exited with {status}", task.step, task.file.display());

        let fatal = match stderr {
            Some(mut handle) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut handle).await {
                Ok(Ok(Ok(fatal))) => fatal,
                Ok(Ok(Err(e))) => {
                    log::error!("Failed to write {}: {e:?}", task.err_file.display());
                    None
                }
                Ok(Err(e)) => {
                    log::error!("Error reader for {} failed: {e:?}", task.file.display());
                    None
                }
                Err(_) => {
                    log::warn!(
                        "Error output of tcpreplay for {} is still open after it exited",
                        task.file.display()
                    );
                    handle.abort();
                    None
                }
            },
            None => None,
        };

        // A process that exits by itself may report its fatal error after closing its output.
        Ok(match (attempt, fatal) {
            (Attempt::Exited, Some(line)) => Attempt::Fatal { line },
            (attempt, _) => attempt,
        })
    }
}

async fn open_append(path: &Path) -> BlasterResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))
}

async fn append_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await
}

async fn write_epoch(file: &mut File) -> std::io::Result<()> {
    append_line(file, &chrono::Utc::now().timestamp().to_string()).await
}

/// Copy error output to `path`, returning the first fatal line. The fatal line is also sent on
/// `fatal` as soon as it is seen.
async fn drain_stderr(
    stderr: ChildStderr,
    path: PathBuf,
    fatal: mpsc::Sender<String>,
) -> BlasterResult<Option<String>> {
    let mut file = open_append(&path).await?;
    let mut lines = OutputLines::new(stderr);
    let mut first_fatal = None;

    while let Some(line) = lines.next_line().await? {
        append_line(&mut file, &line).await?;

        if first_fatal.is_none() && FatalTelemetryError::is_fatal_line(&line) {
            // The receiver is gone once the process has been dealt with.
            let _ = fatal.try_send(line.clone());
            first_fatal = Some(line);
        }
    }

    Ok(first_fatal)
}

#[cfg(test)]
mod tests {
    use blaster_core::prelude::{BaseSpeed, PlanKind, ReplayArg, SpikeOverride, StepPhase};
    use pretty_assertions::assert_eq;

    use super::*;

    fn plan(base_speed: BaseSpeed) -> TestPlan {
        TestPlan::new(
            1,
            5,
            base_speed,
            None,
            "/tmp/run",
            PlanKind::MaxPerf {
                step_duration_s: 60,
                start_percent: 50.0,
                increment_percent: 10.0,
            },
        )
        .expect("valid plan")
    }

    fn step() -> Step {
        Step {
            number: 2,
            phase: StepPhase::Spike { cycle: 1 },
            load_percent: 50.0,
            duration_s: 60,
            spike: Some(SpikeOverride {
                load_percent: 90.0,
                targets: vec![1],
            }),
        }
    }

    #[test]
    fn task_for_workload() {
        let workload = Workload::new(0, "/data/http.pcap", "eth1")
            .with_percentage(20.0)
            .with_loop_count(10)
            .with_percent_scaled_loops(true);

        let task = ReplayTask::new(&step(), &workload, &plan(BaseSpeed::pps(10_000.0)));

        assert_eq!(task.load_percent, 50.0);
        assert_eq!(task.target_speed, 1000.0);
        assert_eq!(task.loops, 5);
        assert_eq!(task.duration_s, 65);
        assert_eq!(
            task.stats_file,
            PathBuf::from("/tmp/run/stats__step_2__file_num_0__http.pcap.log")
        );
        assert_eq!(
            task.err_file,
            PathBuf::from("/tmp/run/err__step_2__file_num_0__http.pcap.log")
        );
    }

    #[test]
    fn spike_target_gets_spike_load() {
        let workload = Workload::new(1, "/data/dns.pcap", "eth1").with_percentage(100.0);

        let task = ReplayTask::new(&step(), &workload, &plan(BaseSpeed::mbps(100.0)));

        assert_eq!(task.load_percent, 90.0);
        assert_eq!(task.target_speed, 90.0);
        assert_eq!(task.unit, SpeedUnit::Mbps);
    }

    #[test]
    fn args_in_order() {
        let workload = Workload::new(0, "/data/http.pcap", "eth1")
            .with_percentage(100.0)
            .with_loop_count(3)
            .with_netmap_privilege(true);
        let mut policy = RunPolicy::default();
        policy.extra_args = vec![
            ReplayArg::Flag("mtu-trunc".to_string()),
            ReplayArg::Value("mtu".to_string(), "1500".to_string()),
        ];

        let task = ReplayTask::new(&step(), &workload, &plan(BaseSpeed::pps(2000.0)));

        assert_eq!(
            task.args(&policy),
            vec![
                "-i",
                "eth1",
                "--stats=1",
                "--loop=0",
                "--duration=65",
                "--preload-pcap",
                "--unique-ip",
                "--unique-ip-loops=3",
                "--pps=1000",
                "--netmap",
                "--nm-delay=2",
                "--mtu-trunc",
                "--mtu=1500",
                "/data/http.pcap",
            ]
        );
    }

    #[test]
    fn args_without_optional_flags() {
        let workload = Workload::new(0, "/data/http.pcap", "eth1")
            .with_percentage(100.0)
            .with_loop_count(0)
            .with_preload_in_ram(false);

        let task = ReplayTask::new(&step(), &workload, &plan(BaseSpeed::mbps(10.0)));

        assert_eq!(
            task.args(&RunPolicy::default()),
            vec![
                "-i",
                "eth1",
                "--stats=1",
                "--loop=0",
                "--duration=65",
                "--mbps=5",
                "/data/http.pcap",
            ]
        );
    }
}
