use blaster_core::prelude::{FatalTelemetryError, TestPlan, WorkloadSet};
use blaster_summary_model::{RunSummary, WorkerOutcome};

use crate::hooks::StageHooks;
use crate::progress::Progress;
use crate::step::StepCoordinator;
use crate::types::BlasterResult;

/// Runs the steps of a [TestPlan] one after the other.
pub struct TestScheduler {
    plan: TestPlan,
    workloads: WorkloadSet,
    hooks: StageHooks,
    coordinator: StepCoordinator,
}

impl TestScheduler {
    pub fn new(
        plan: TestPlan,
        workloads: WorkloadSet,
        hooks: StageHooks,
        coordinator: StepCoordinator,
    ) -> Self {
        Self {
            plan,
            workloads,
            hooks,
            coordinator,
        }
    }

    /// Run every step, recording each into `summary` as it completes.
    ///
    /// A fatal error reported by tcpreplay lets the rest of its step finish and then stops the
    /// run with a [FatalTelemetryError].
    pub async fn run(
        &self,
        summary: &mut RunSummary,
        progress: Option<&Progress>,
    ) -> BlasterResult<()> {
        let test_type = self.plan.test_type();
        let schedule = self.plan.schedule();
        log::info!("{test_type} test with {} steps", schedule.len());

        for (index, step) in schedule.iter().enumerate() {
            let first = index == 0;
            if let Some(progress) = progress {
                progress.set_step(step);
            }

            self.hooks.before_step(step, first).await;

            log::info!(
                "Start step {} ({}) at {}% load for {}s",
                step.number,
                step.phase,
                step.load_percent,
                step.duration_s + self.plan.impact_s
            );
            let step_summary = self.coordinator.run(step, &self.workloads, &self.plan).await;
            log::info!("End step {}", step.number);

            self.hooks.after_step(step, first).await;

            let fatal = step_summary.workers.iter().find_map(|w| match &w.outcome {
                WorkerOutcome::FatalTelemetry { line } => Some(FatalTelemetryError::new(
                    step.number,
                    w.workload_id,
                    line.clone(),
                )),
                _ => None,
            });
            summary.add_step(step_summary);

            if let Some(fatal) = fatal {
                return Err(fatal.into());
            }
        }

        log::info!("{test_type} test completed");
        Ok(())
    }
}

