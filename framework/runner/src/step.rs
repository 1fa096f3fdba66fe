use std::path::PathBuf;
use std::sync::Arc;

use blaster_core::prelude::{RunPolicy, Step, TestPlan, WorkloadSet};
use blaster_summary_model::{StepSummary, WorkerOutcome, WorkerSummary};

use crate::worker::{ReplayTask, ReplayWorker};

/// Starts one [ReplayWorker] per workload for a step and waits for all of them.
pub struct StepCoordinator {
    policy: Arc<RunPolicy>,
    binary: Arc<PathBuf>,
}

impl StepCoordinator {
    pub fn new(policy: Arc<RunPolicy>, binary: Arc<PathBuf>) -> Self {
        Self { policy, binary }
    }

    /// Run a step. Returns once every worker has finished, whatever the outcome.
    pub async fn run(&self, step: &Step, workloads: &WorkloadSet, plan: &TestPlan) -> StepSummary {
        let started_at = chrono::Utc::now().timestamp();

        let tasks: Vec<ReplayTask> = workloads
            .iter()
            .map(|workload| ReplayTask::new(step, workload, plan))
            .collect();

        let handles = tasks.iter().cloned().map(|task| {
            let worker = ReplayWorker::new(task, self.policy.clone(), self.binary.clone());
            tokio::spawn(worker.run())
        });
        let results = futures::future::join_all(handles).await;

        let workers = tasks
            .iter()
            .zip(results)
            .map(|(task, result)| match result {
                Ok(summary) => summary,
                Err(e) => {
                    log::error!("Worker for {} did not complete: {e:?}", task.file.display());
                    WorkerSummary {
                        workload_id: task.workload_id,
                        load_percent: task.load_percent,
                        target_speed: task.target_speed,
                        loops: task.loops,
                        restarts: 0,
                        outcome: WorkerOutcome::Failed {
                            error: e.to_string(),
                        },
                    }
                }
            })
            .collect();

        StepSummary {
            number: step.number,
            phase: step.phase.to_string(),
            load_percent: step.load_percent,
            duration_s: step.duration_s,
            started_at,
            finished_at: chrono::Utc::now().timestamp(),
            workers,
        }
    }
}
