//! Loading of the general and load YAML files into a validated run configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use blaster_core::prelude::{
    BaseSpeed, ConfigError, PlanKind, ReplayArg, RunPolicy, TestPlan, TestType, Workload,
    WorkloadSet,
};
use serde::{Deserialize, Serialize};

use crate::cli::BlasterCli;
use crate::hooks::StageHook;
use crate::types::BlasterResult;

/// The general config file.
#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub run_config: RunSection,
    pub pcap_files: Vec<PcapFileSection>,
    /// Passed through to tcpreplay, in order.
    #[serde(default)]
    pub tcpreplay_args: serde_yaml::Mapping,
    #[serde(default)]
    pub bash_scripts_config: Vec<StageHook>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub netmap_mode: bool,
    pub speed_check: bool,
    pub speed_check_interval: i64,
    pub speed_threshold: f64,
    pub is_sudo: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            netmap_mode: false,
            speed_check: false,
            speed_check_interval: 3,
            speed_threshold: 1.2,
            is_sudo: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PcapFileSection {
    pub file: PathBuf,
    #[serde(default)]
    pub percentage: f64,
    pub interface: Option<String>,
    pub loop_count: Option<u64>,
    #[serde(default)]
    pub is_percent_loop_calculate: bool,
    #[serde(default = "default_true")]
    pub preload_in_ram: bool,
    #[serde(default)]
    pub netmap_privilege: bool,
}

fn default_true() -> bool {
    true
}

fn default_steps() -> u32 {
    1
}

/// Fields shared by every section of the load config.
#[derive(Debug, Deserialize)]
struct CommonLoad {
    #[serde(default = "default_steps")]
    steps: u32,
    impact: u64,
    total_sessions_per_min: Option<u64>,
    base_speed_pps: Option<f64>,
    base_speed_mbps: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MaxPerfLoad {
    step_duration: u64,
    start_speed_percent: f64,
    increment_percent: f64,
}

#[derive(Debug, Deserialize)]
struct StabilityLoad {
    step_duration: u64,
    step_percent: f64,
}

#[derive(Debug, Deserialize)]
struct SpikeLoad {
    spike_duration: u64,
    stability_speed_duration: u64,
    stability_speed_percent: f64,
    spike_base_percent: f64,
    increment_percent: f64,
    #[serde(default)]
    pcap_for_spike: Option<Vec<PathBuf>>,
}

/// Per-run values that come from the command line rather than the config files.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub test_type: TestType,
    pub test_id: i64,
    pub test_tag: String,
    pub sudo_password: Option<String>,
    pub output_dir: PathBuf,
}

impl RunOptions {
    pub fn from_cli(cli: &BlasterCli) -> Self {
        let test_type = TestType::from(cli.test_type);
        let output_dir = cli.test_folder.clone().unwrap_or_else(|| {
            run_dir(
                Path::new("load_tests"),
                test_type,
                cli.test_id,
                &cli.test_tag,
                chrono::Local::now(),
            )
        });

        Self {
            test_type,
            test_id: cli.test_id,
            test_tag: cli.test_tag.clone(),
            sudo_password: cli.sudo_password.clone(),
            output_dir,
        }
    }
}

/// `<root>/<test type>/<id>__<tag>__<timestamp>`
pub fn run_dir(
    root: &Path,
    test_type: TestType,
    test_id: i64,
    test_tag: &str,
    now: chrono::DateTime<chrono::Local>,
) -> PathBuf {
    root.join(test_type.as_str()).join(format!(
        "{test_id}__{test_tag}__{}",
        now.format("%Y-%m-%d_%H-%M-%S")
    ))
}

/// Everything a run needs, validated.
#[derive(Debug, Serialize)]
pub struct Config {
    pub workloads: WorkloadSet,
    pub policy: RunPolicy,
    pub plan: TestPlan,
    pub hooks: Vec<StageHook>,
}

impl Config {
    /// Read both config files and build the run configuration.
    pub fn load(general: &Path, load: &Path, options: &RunOptions) -> BlasterResult<Self> {
        let general_yaml = std::fs::read_to_string(general)
            .with_context(|| format!("Failed to read general config {}", general.display()))?;
        let load_yaml = std::fs::read_to_string(load)
            .with_context(|| format!("Failed to read load config {}", load.display()))?;

        Self::from_yaml(&general_yaml, &load_yaml, options)
    }

    /// Build the run configuration from the contents of both config files.
    ///
    /// Capture files are scanned here when a unique IP loop count has to be derived.
    pub fn from_yaml(general_yaml: &str, load_yaml: &str, options: &RunOptions) -> BlasterResult<Self> {
        let general: GeneralConfig =
            serde_yaml::from_str(general_yaml).context("Failed to parse general config")?;

        let mut workloads = workloads(&general)?;

        let mut policy = RunPolicy::new(
            general.run_config.speed_check,
            general.run_config.speed_check_interval,
            general.run_config.speed_threshold,
        );
        if general.run_config.is_sudo {
            policy = policy.with_sudo(options.sudo_password.clone());
        }
        policy.netmap_mode = general.run_config.netmap_mode;
        policy.extra_args = replay_args(&general.tcpreplay_args)?;

        let sections: HashMap<TestType, serde_yaml::Value> =
            serde_yaml::from_str(load_yaml).context("Failed to parse load config")?;
        let Some(section) = sections.get(&options.test_type) else {
            bail!(
                "No '{}' section in load config",
                options.test_type.as_str()
            );
        };
        let plan = plan(section, options, &workloads)?;

        workloads.resolve_loop_counts(plan.base_speed, plan.total_sessions_per_min)?;

        Ok(Self {
            workloads,
            policy,
            plan,
            hooks: general.bash_scripts_config,
        })
    }

    /// YAML dump of the resolved configuration for the log. The sudo password is never included.
    pub fn dump(&self) -> BlasterResult<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }
}

fn workloads(general: &GeneralConfig) -> Result<WorkloadSet, ConfigError> {
    let default_interface = general
        .pcap_files
        .first()
        .and_then(|p| p.interface.clone());

    let workloads = general
        .pcap_files
        .iter()
        .enumerate()
        .map(|(id, section)| {
            let interface = section
                .interface
                .clone()
                .or_else(|| default_interface.clone())
                .ok_or_else(|| ConfigError::Invalid {
                    field: "interface",
                    reason: "the first pcap file must name an interface".to_string(),
                })?;

            let mut workload = Workload::new(id, &section.file, interface)
                .with_percentage(section.percentage)
                .with_percent_scaled_loops(section.is_percent_loop_calculate)
                .with_preload_in_ram(section.preload_in_ram)
                .with_netmap_privilege(section.netmap_privilege);
            if let Some(loop_count) = section.loop_count {
                workload = workload.with_loop_count(loop_count);
            }
            Ok(workload)
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    WorkloadSet::new(workloads, general.run_config.netmap_mode)
}

fn replay_args(mapping: &serde_yaml::Mapping) -> BlasterResult<Vec<ReplayArg>> {
    mapping
        .iter()
        .map(|(key, value)| {
            let name = scalar(key).with_context(|| format!("Invalid tcpreplay_args key {key:?}"))?;
            Ok(match value {
                serde_yaml::Value::Null => ReplayArg::Flag(name),
                serde_yaml::Value::Sequence(values) => ReplayArg::List(
                    name,
                    values
                        .iter()
                        .map(|v| scalar(v).with_context(|| format!("Invalid value {v:?}")))
                        .collect::<BlasterResult<Vec<_>>>()?,
                ),
                other => ReplayArg::Value(
                    name.clone(),
                    scalar(other)
                        .with_context(|| format!("Invalid value for tcpreplay_args '{name}'"))?,
                ),
            })
        })
        .collect()
}

fn scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn plan(
    section: &serde_yaml::Value,
    options: &RunOptions,
    workloads: &WorkloadSet,
) -> BlasterResult<TestPlan> {
    let test_type = options.test_type;
    let common: CommonLoad = serde_yaml::from_value(section.clone())
        .with_context(|| format!("Invalid '{test_type}' section in load config"))?;
    let base_speed = BaseSpeed::from_options(common.base_speed_pps, common.base_speed_mbps)?;

    let kind = match test_type {
        TestType::MaxPerf => {
            let load: MaxPerfLoad = serde_yaml::from_value(section.clone())
                .context("Invalid 'max_perf' section in load config")?;
            PlanKind::MaxPerf {
                step_duration_s: load.step_duration,
                start_percent: load.start_speed_percent,
                increment_percent: load.increment_percent,
            }
        }
        TestType::Stability => {
            let load: StabilityLoad = serde_yaml::from_value(section.clone())
                .context("Invalid 'stability' section in load config")?;
            PlanKind::Stability {
                step_duration_s: load.step_duration,
                step_percent: load.step_percent,
            }
        }
        TestType::Spike => {
            let load: SpikeLoad = serde_yaml::from_value(section.clone())
                .context("Invalid 'spike' section in load config")?;
            let spike_targets = match &load.pcap_for_spike {
                Some(files) => files
                    .iter()
                    .map(|file| {
                        workloads
                            .id_of_file(file)
                            .ok_or_else(|| ConfigError::UnknownSpikeTarget(file.display().to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                None => Vec::new(),
            };
            PlanKind::Spike {
                spike_duration_s: load.spike_duration,
                stability_duration_s: load.stability_speed_duration,
                stability_percent: load.stability_speed_percent,
                spike_base_percent: load.spike_base_percent,
                increment_percent: load.increment_percent,
                spike_targets,
            }
        }
        TestType::Custom => PlanKind::Custom,
    };

    Ok(TestPlan::new(
        common.steps,
        common.impact,
        base_speed,
        common.total_sessions_per_min,
        &options.output_dir,
        kind,
    )?)
}
