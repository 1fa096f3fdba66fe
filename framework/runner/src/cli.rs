use std::path::PathBuf;

use blaster_core::prelude::TestType;
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "pcap-blaster", version, about, long_about = None)]
pub struct BlasterCli {
    /// The general config: run settings, pcap files, extra tcpreplay arguments and stage scripts
    #[clap(short, long, default_value = "config/config.yaml")]
    pub config: PathBuf,

    /// The load config, with one section per test type
    #[clap(short, long, default_value = "config/load.yaml")]
    pub load: PathBuf,

    /// Password for sudo, only used if `is_sudo` is set in the general config
    #[clap(short = 'p', long, env = "SUDO_PASS", hide_env_values = true)]
    pub sudo_password: Option<String>,

    /// Id of the test, used to name the run directory
    #[clap(short = 'i', long, default_value_t = -1, allow_negative_numbers = true)]
    pub test_id: i64,

    /// Free form tag for the test, used to name the run directory
    #[clap(short = 't', long, default_value = "DEBUG")]
    pub test_tag: String,

    /// The kind of test to run
    #[clap(short = 'T', long, value_enum)]
    pub test_type: TestTypeArg,

    /// Write into this directory instead of a new one under `load_tests/`.
    ///
    /// The load test still runs. This does not regenerate reports from an earlier run.
    #[clap(short = 'f', long)]
    pub test_folder: Option<PathBuf>,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false")]
    pub no_progress: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum TestTypeArg {
    MaxPerf,
    Stability,
    Spike,
    Custom,
}

impl From<TestTypeArg> for TestType {
    fn from(value: TestTypeArg) -> Self {
        match value {
            TestTypeArg::MaxPerf => TestType::MaxPerf,
            TestTypeArg::Stability => TestType::Stability,
            TestTypeArg::Spike => TestType::Spike,
            TestTypeArg::Custom => TestType::Custom,
        }
    }
}
