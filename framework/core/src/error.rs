use std::path::PathBuf;

use crate::plan::TestType;

/// Problems with the configured workloads or test plan. These are detected before any traffic is
/// sent and abort the run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("At least one pcap file must be configured")]
    NoWorkloads,
    #[error("Percentage of pcap files is not equal to 100.0: {0}")]
    PercentageSum(f64),
    #[error("Only one parameter of speed can be in config, found both 'base_speed_pps' and 'base_speed_mbps'")]
    AmbiguousSpeed,
    #[error("There is no speed param in load config, expected 'base_speed_pps' or 'base_speed_mbps'")]
    MissingSpeed,
    #[error("Spike pcap file \"{0}\" not in general config")]
    UnknownSpikeTarget(String),
    #[error("Test type \"{0}\" is not implemented yet")]
    NotImplemented(TestType),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure to read session statistics out of a capture file.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to read capture file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Capture file {} is not a valid pcap: {reason}", path.display())]
    Format { path: PathBuf, reason: String },
}

/// Anything that can go wrong while preparing workloads for a run.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}
