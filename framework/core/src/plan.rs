use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::BaseSpeed;

/// The kinds of test that can be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    MaxPerf,
    Stability,
    Spike,
    Custom,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::MaxPerf => "max_perf",
            TestType::Stability => "stability",
            TestType::Spike => "spike",
            TestType::Custom => "custom",
        }
    }
}

impl Display for TestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variant specific shape of a test plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanKind {
    /// Ramp the load up by `increment_percent` on every step.
    MaxPerf {
        step_duration_s: u64,
        start_percent: f64,
        increment_percent: f64,
    },
    /// A single step at a fixed load.
    Stability { step_duration_s: u64, step_percent: f64 },
    /// Alternate a stability period with a spike period for the targeted workloads.
    Spike {
        spike_duration_s: u64,
        stability_duration_s: u64,
        stability_percent: f64,
        spike_base_percent: f64,
        increment_percent: f64,
        /// Ids of the workloads that receive the spike load.
        spike_targets: Vec<usize>,
    },
    /// Reserved.
    Custom,
}

impl PlanKind {
    pub fn test_type(&self) -> TestType {
        match self {
            PlanKind::MaxPerf { .. } => TestType::MaxPerf,
            PlanKind::Stability { .. } => TestType::Stability,
            PlanKind::Spike { .. } => TestType::Spike,
            PlanKind::Custom => TestType::Custom,
        }
    }
}

/// A validated test plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestPlan {
    /// Number of steps, or of stability/spike cycles for a spike test.
    pub steps: u32,
    /// Settle time added to every step's duration, in seconds.
    pub impact_s: u64,
    pub base_speed: BaseSpeed,
    pub total_sessions_per_min: Option<u64>,
    /// Directory that receives the stats and error files of the run.
    pub output_dir: PathBuf,
    pub kind: PlanKind,
}

/// What a step is for, used to label log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Load,
    Stability { cycle: u32 },
    Spike { cycle: u32 },
}

impl Display for StepPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StepPhase::Load => write!(f, "load"),
            StepPhase::Stability { cycle } => write!(f, "stability period of cycle {cycle}"),
            StepPhase::Spike { cycle } => write!(f, "spike period of cycle {cycle}"),
        }
    }
}

/// Load override for the spike targets during a spike period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpikeOverride {
    pub load_percent: f64,
    pub targets: Vec<usize>,
}

/// One scheduled step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    /// 1-based, strictly increasing across the plan.
    pub number: u32,
    pub phase: StepPhase,
    pub load_percent: f64,
    pub duration_s: u64,
    pub spike: Option<SpikeOverride>,
}

impl Step {
    /// The load for the workload with `workload_id` during this step.
    pub fn load_percent_for(&self, workload_id: usize) -> f64 {
        match &self.spike {
            Some(spike) if spike.targets.contains(&workload_id) => spike.load_percent,
            _ => self.load_percent,
        }
    }
}

impl TestPlan {
    /// Validate a plan. The custom test type is rejected here.
    pub fn new(
        steps: u32,
        impact_s: u64,
        base_speed: BaseSpeed,
        total_sessions_per_min: Option<u64>,
        output_dir: impl Into<PathBuf>,
        kind: PlanKind,
    ) -> Result<Self, ConfigError> {
        if kind == PlanKind::Custom {
            return Err(ConfigError::NotImplemented(TestType::Custom));
        }
        if base_speed.value.is_nan() || base_speed.value <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "base_speed",
                reason: format!("must be positive, got {}", base_speed.value),
            });
        }

        Ok(Self {
            steps,
            impact_s,
            base_speed,
            total_sessions_per_min,
            output_dir: output_dir.into(),
            kind,
        })
    }

    pub fn test_type(&self) -> TestType {
        self.kind.test_type()
    }

    /// The steps of this plan in the order they run.
    pub fn schedule(&self) -> Vec<Step> {
        match &self.kind {
            PlanKind::MaxPerf {
                step_duration_s,
                start_percent,
                increment_percent,
            } => (1..=self.steps)
                .map(|number| Step {
                    number,
                    phase: StepPhase::Load,
                    load_percent: start_percent + increment_percent * f64::from(number - 1),
                    duration_s: *step_duration_s,
                    spike: None,
                })
                .collect(),
            PlanKind::Stability {
                step_duration_s,
                step_percent,
            } => vec![Step {
                number: 1,
                phase: StepPhase::Load,
                load_percent: *step_percent,
                duration_s: *step_duration_s,
                spike: None,
            }],
            PlanKind::Spike {
                spike_duration_s,
                stability_duration_s,
                stability_percent,
                spike_base_percent,
                increment_percent,
                spike_targets,
            } => (1..=self.steps)
                .flat_map(|cycle| {
                    [
                        Step {
                            number: cycle * 2 - 1,
                            phase: StepPhase::Stability { cycle },
                            load_percent: *stability_percent,
                            duration_s: *stability_duration_s,
                            spike: None,
                        },
                        Step {
                            number: cycle * 2,
                            phase: StepPhase::Spike { cycle },
                            load_percent: *stability_percent,
                            duration_s: *spike_duration_s,
                            spike: Some(SpikeOverride {
                                load_percent: spike_base_percent
                                    + increment_percent * f64::from(cycle - 1),
                                targets: spike_targets.clone(),
                            }),
                        },
                    ]
                })
                .collect(),
            PlanKind::Custom => Vec::new(),
        }
    }

    /// Total time the plan is expected to take, including the impact window of every step.
    pub fn planned_runtime(&self) -> Duration {
        Duration::from_secs(
            self.schedule()
                .iter()
                .map(|step| step.duration_s + self.impact_s)
                .sum(),
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn plan(steps: u32, kind: PlanKind) -> TestPlan {
        TestPlan::new(steps, 5, BaseSpeed::pps(1000.0), None, "/tmp/out", kind).expect("valid plan")
    }

    #[test]
    fn max_perf_ramps_up() {
        let plan = plan(
            4,
            PlanKind::MaxPerf {
                step_duration_s: 60,
                start_percent: 10.0,
                increment_percent: 15.0,
            },
        );

        let loads: Vec<(u32, f64)> = plan
            .schedule()
            .iter()
            .map(|s| (s.number, s.load_percent))
            .collect();
        assert_eq!(loads, vec![(1, 10.0), (2, 25.0), (3, 40.0), (4, 55.0)]);
        assert_eq!(plan.planned_runtime(), Duration::from_secs(4 * 65));
    }

    #[test]
    fn stability_is_a_single_step() {
        let plan = plan(
            10,
            PlanKind::Stability {
                step_duration_s: 600,
                step_percent: 70.0,
            },
        );

        let schedule = plan.schedule();
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].number, 1);
        assert_eq!(schedule[0].load_percent, 70.0);
        assert_eq!(schedule[0].duration_s, 600);
    }

    #[test]
    fn spike_alternates_stability_and_spike() {
        let plan = plan(
            3,
            PlanKind::Spike {
                spike_duration_s: 10,
                stability_duration_s: 30,
                stability_percent: 50.0,
                spike_base_percent: 80.0,
                increment_percent: 10.0,
                spike_targets: vec![1],
            },
        );

        let schedule = plan.schedule();
        let numbers: Vec<u32> = schedule.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);

        for cycle in 1..=3u32 {
            let stability = &schedule[(cycle * 2 - 2) as usize];
            let spike = &schedule[(cycle * 2 - 1) as usize];

            assert_eq!(stability.phase, StepPhase::Stability { cycle });
            assert_eq!(stability.duration_s, 30);
            assert_eq!(stability.load_percent_for(1), 50.0);

            let expected_spike = 80.0 + 10.0 * f64::from(cycle - 1);
            assert_eq!(spike.phase, StepPhase::Spike { cycle });
            assert_eq!(spike.duration_s, 10);
            assert_eq!(spike.load_percent_for(1), expected_spike);
            assert_eq!(spike.load_percent_for(0), 50.0);
        }

        assert_eq!(plan.planned_runtime(), Duration::from_secs(3 * (35 + 15)));
    }

    #[test]
    fn custom_is_not_implemented() {
        let result = TestPlan::new(1, 0, BaseSpeed::pps(1.0), None, "/tmp", PlanKind::Custom);
        assert!(matches!(
            result,
            Err(ConfigError::NotImplemented(TestType::Custom))
        ));
    }

    #[test]
    fn base_speed_must_be_positive() {
        let result = TestPlan::new(
            1,
            0,
            BaseSpeed::mbps(0.0),
            None,
            "/tmp",
            PlanKind::Stability {
                step_duration_s: 1,
                step_percent: 100.0,
            },
        );
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(TestType::MaxPerf.to_string(), "max_perf");
        assert_eq!(TestType::Spike.as_str(), "spike");
    }
}
