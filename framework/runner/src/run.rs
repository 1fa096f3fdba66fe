use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use blaster_summary_model::{append_run_summary, RunSummary, WorkloadSummary};

use crate::cli::BlasterCli;
use crate::config::{Config, RunOptions};
use crate::hooks::StageHooks;
use crate::init::LogSinks;
use crate::progress::Progress;
use crate::replay_binary::tcpreplay_path;
use crate::scheduler::TestScheduler;
use crate::step::StepCoordinator;
use crate::types::BlasterResult;

/// Appended to in the run directory at the end of every run.
pub const RUN_SUMMARY_FILE: &str = "run_summary.jsonl";

/// Load the configuration named on the command line and run the test.
pub fn run(cli: BlasterCli, sinks: LogSinks) -> BlasterResult<RunSummary> {
    let options = RunOptions::from_cli(&cli);
    std::fs::create_dir_all(&options.output_dir).with_context(|| {
        format!(
            "Failed to create run directory {}",
            options.output_dir.display()
        )
    })?;
    sinks
        .attach_run_dir(&options.output_dir)
        .context("Failed to open run log files")?;
    log::info!("Writing results to {}", options.output_dir.display());

    let config = Config::load(&cli.config, &cli.load, &options)?;
    let binary = tcpreplay_path(config.policy.sudo)?;

    execute(config, &options, binary, !cli.no_progress)
}

/// Run a test with a loaded configuration and the tcpreplay binary at `binary`.
///
/// The run summary is appended to [RUN_SUMMARY_FILE] in the run directory whether or not the run
/// succeeds.
pub fn execute(
    config: Config,
    options: &RunOptions,
    binary: PathBuf,
    show_progress: bool,
) -> BlasterResult<RunSummary> {
    log::info!("Resolved configuration:\n{}", config.dump()?);

    let Config {
        workloads,
        policy,
        plan,
        hooks,
    } = config;

    let mut summary = RunSummary::new(
        nanoid::nanoid!(),
        plan.test_type().to_string(),
        options.test_id,
        options.test_tag.clone(),
        chrono::Utc::now().timestamp(),
        plan.planned_runtime().as_secs(),
        workloads
            .iter()
            .map(|w| WorkloadSummary {
                id: w.id,
                file: w.file.display().to_string(),
                interface: w.interface.clone(),
                percentage: w.percentage,
                loop_count: w.loop_count.unwrap_or(0),
                netmap: w.netmap,
            })
            .collect(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    summary.add_setting(
        format!("base_speed_{}", plan.base_speed.unit.label().to_lowercase()),
        plan.base_speed.value,
    );
    summary.add_setting("steps", plan.steps);
    summary.add_setting("impact", plan.impact_s);
    if let Some(total) = plan.total_sessions_per_min {
        summary.add_setting("total_sessions_per_min", total);
    }
    summary.add_setting("speed_check", policy.speed_check);
    summary.add_setting("speed_check_interval", policy.speed_check_interval);
    summary.add_setting("speed_threshold", policy.speed_threshold);
    summary.add_setting("netmap_mode", policy.netmap_mode);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let progress = if show_progress {
        Some(Progress::start(plan.planned_runtime())?)
    } else {
        None
    };

    let output_dir = plan.output_dir.clone();
    let scheduler = TestScheduler::new(
        plan,
        workloads,
        StageHooks::new(hooks),
        StepCoordinator::new(Arc::new(policy), Arc::new(binary)),
    );

    let result = runtime.block_on(async {
        tokio::select! {
            result = scheduler.run(&mut summary, progress.as_ref()) => result,
            _ = tokio::signal::ctrl_c() => {
                log::warn!("Received shutdown signal, stopping replays");
                Err(anyhow::anyhow!("Run interrupted"))
            }
        }
    });

    if let Some(progress) = progress {
        progress.finish();
    }
    // Stops any replay that is still running.
    drop(runtime);

    if result.is_ok() {
        summary.set_finished_at(chrono::Utc::now().timestamp());
    }

    let summary_path = output_dir.join(RUN_SUMMARY_FILE);
    match append_run_summary(&summary, &summary_path) {
        Ok(()) => log::info!(
            "Run {} ({} restarts) written to {}, fingerprint {}",
            summary.run_id,
            summary.total_restarts(),
            summary_path.display(),
            summary.fingerprint()
        ),
        Err(e) => log::error!(
            "Failed to write run summary to {}: {e:?}",
            summary_path.display()
        ),
    }

    result.map(|()| summary)
}
