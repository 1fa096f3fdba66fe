use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::capture::SessionStatistics;
use crate::error::ConfigError;

/// The unit that speeds are expressed in, both for the configured base speed and the rate that the
/// replay binary reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedUnit {
    /// Packets per second.
    Pps,
    /// Megabits per second.
    Mbps,
}

impl SpeedUnit {
    pub fn label(&self) -> &'static str {
        match self {
            SpeedUnit::Pps => "PPS",
            SpeedUnit::Mbps => "MBPS",
        }
    }
}

/// The speed that corresponds to 100% load, summed over all workloads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BaseSpeed {
    pub value: f64,
    pub unit: SpeedUnit,
}

impl BaseSpeed {
    pub fn pps(value: f64) -> Self {
        Self {
            value,
            unit: SpeedUnit::Pps,
        }
    }

    pub fn mbps(value: f64) -> Self {
        Self {
            value,
            unit: SpeedUnit::Mbps,
        }
    }

    /// Resolve the base speed from the two optional config values, exactly one of which must be set.
    pub fn from_options(pps: Option<f64>, mbps: Option<f64>) -> Result<Self, ConfigError> {
        match (pps, mbps) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousSpeed),
            (Some(pps), None) => Ok(Self::pps(pps)),
            (None, Some(mbps)) => Ok(Self::mbps(mbps)),
            (None, None) => Err(ConfigError::MissingSpeed),
        }
    }

    /// The speed for one workload at the given step load.
    pub fn scaled(&self, load_percent: f64, workload_percentage: f64) -> f64 {
        self.value * (load_percent / 100.0) * (workload_percentage / 100.0)
    }
}

/// One capture file replayed onto one interface with a share of the total load.
#[derive(Debug, Clone, Serialize)]
pub struct Workload {
    /// Ordinal position in the configuration, used in output file names.
    pub id: usize,
    pub file: PathBuf,
    pub interface: String,
    /// Share of the total load, 0 to 100.
    pub percentage: f64,
    /// `None` until resolved, `Some(0)` disables unique IP looping.
    pub loop_count: Option<u64>,
    /// Scale the loop count with each step's load percent.
    pub percent_scaled_loops: bool,
    pub preload_in_ram: bool,
    /// Explicitly requested netmap transmission.
    pub netmap_privilege: bool,
    /// Whether this workload is replayed with netmap, after auto assignment.
    pub netmap: bool,
    /// Populated when the loop count is derived from the capture.
    pub session_statistics: Option<SessionStatistics>,
}

impl Workload {
    pub fn new(id: usize, file: impl Into<PathBuf>, interface: impl Into<String>) -> Self {
        Self {
            id,
            file: file.into(),
            interface: interface.into(),
            percentage: 0.0,
            loop_count: None,
            percent_scaled_loops: false,
            preload_in_ram: true,
            netmap_privilege: false,
            netmap: false,
            session_statistics: None,
        }
    }

    pub fn with_percentage(mut self, percentage: f64) -> Self {
        self.percentage = percentage;
        self
    }

    pub fn with_loop_count(mut self, loop_count: u64) -> Self {
        self.loop_count = Some(loop_count);
        self
    }

    pub fn with_percent_scaled_loops(mut self, enabled: bool) -> Self {
        self.percent_scaled_loops = enabled;
        self
    }

    pub fn with_preload_in_ram(mut self, enabled: bool) -> Self {
        self.preload_in_ram = enabled;
        self
    }

    pub fn with_netmap_privilege(mut self, enabled: bool) -> Self {
        self.netmap_privilege = enabled;
        self.netmap = enabled;
        self
    }

    /// The file name of the capture, used to label output files.
    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file.display().to_string())
    }

    /// The loop count to pass for a step at `load_percent`.
    pub fn loops_for_step(&self, load_percent: f64) -> u64 {
        let loop_count = self.loop_count.unwrap_or(0);
        if self.percent_scaled_loops && loop_count != 0 {
            (loop_count as f64 * (load_percent / 100.0)).floor().max(0.0) as u64
        } else {
            loop_count
        }
    }
}

/// The validated set of workloads for a run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadSet {
    workloads: Vec<Workload>,
}

impl WorkloadSet {
    /// Validate the workloads.
    ///
    /// With more than one workload the percentages must add up to exactly 100. A single workload
    /// always carries the full load. In netmap mode, if no workload asked for netmap explicitly,
    /// the first workload with the largest share is switched to netmap.
    pub fn new(mut workloads: Vec<Workload>, netmap_mode: bool) -> Result<Self, ConfigError> {
        match workloads.len() {
            0 => return Err(ConfigError::NoWorkloads),
            1 => workloads[0].percentage = 100.0,
            _ => {
                let sum: f64 = workloads.iter().map(|w| w.percentage).sum();
                if sum != 100.0 {
                    return Err(ConfigError::PercentageSum(sum));
                }
            }
        }

        if let Some(w) = workloads
            .iter()
            .find(|w| !(0.0..=100.0).contains(&w.percentage))
        {
            return Err(ConfigError::Invalid {
                field: "percentage",
                reason: format!("{} is outside 0..=100 for {}", w.percentage, w.file.display()),
            });
        }

        if netmap_mode && !workloads.iter().any(|w| w.netmap_privilege) {
            let max = workloads
                .iter()
                .map(|w| w.percentage)
                .fold(f64::MIN, f64::max);
            if let Some(w) = workloads.iter_mut().find(|w| w.percentage == max) {
                log::info!("Replaying {} with netmap", w.file.display());
                w.netmap = true;
            }
        }

        Ok(Self { workloads })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Workload> {
        self.workloads.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }

    /// Find the id of the workload replaying `file`.
    pub fn id_of_file(&self, file: &Path) -> Option<usize> {
        self.workloads.iter().find(|w| w.file == file).map(|w| w.id)
    }
}

/// An extra argument passed straight through to the replay binary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ReplayArg {
    /// `--name`
    Flag(String),
    /// `--name=value`
    Value(String, String),
    /// `--name v1 v2 ...`
    List(String, Vec<String>),
}

impl ReplayArg {
    pub fn to_args(&self) -> Vec<String> {
        match self {
            ReplayArg::Flag(name) => vec![format!("--{name}")],
            ReplayArg::Value(name, value) => vec![format!("--{name}={value}")],
            ReplayArg::List(name, values) => std::iter::once(format!("--{name}"))
                .chain(values.iter().cloned())
                .collect(),
        }
    }
}

/// How replay processes are run and supervised.
#[derive(Clone, Serialize)]
pub struct RunPolicy {
    /// Run the replay binary through `sudo`.
    pub sudo: bool,
    #[serde(skip)]
    pub sudo_password: Option<String>,
    /// Restart replays whose reported rate is abnormal.
    pub speed_check: bool,
    /// Minimum seconds between two speed checks.
    pub speed_check_interval: u64,
    /// A rate at or above `target * speed_threshold` is abnormal.
    pub speed_threshold: f64,
    pub netmap_mode: bool,
    pub extra_args: Vec<ReplayArg>,
}

impl RunPolicy {
    /// Build a policy. An interval below 1 second turns the speed check off.
    pub fn new(speed_check: bool, speed_check_interval: i64, speed_threshold: f64) -> Self {
        Self {
            sudo: false,
            sudo_password: None,
            speed_check: speed_check && speed_check_interval >= 1,
            speed_check_interval: speed_check_interval.max(0) as u64,
            speed_threshold,
            netmap_mode: false,
            extra_args: Vec::new(),
        }
    }

    pub fn with_sudo(mut self, password: Option<String>) -> Self {
        self.sudo = true;
        self.sudo_password = password;
        self
    }
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self::new(false, 3, 1.2)
    }
}

impl std::fmt::Debug for RunPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPolicy")
            .field("sudo", &self.sudo)
            .field("sudo_password", &self.sudo_password.as_ref().map(|_| "<redacted>"))
            .field("speed_check", &self.speed_check)
            .field("speed_check_interval", &self.speed_check_interval)
            .field("speed_threshold", &self.speed_threshold)
            .field("netmap_mode", &self.netmap_mode)
            .field("extra_args", &self.extra_args)
            .finish()
    }
}
