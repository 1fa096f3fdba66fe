mod child;
mod cli;
mod config;
mod hooks;
mod init;
mod progress;
mod replay_binary;
mod run;
mod scheduler;
mod step;
mod telemetry;
mod types;
mod worker;

pub mod prelude {
    pub use crate::child::{OutputLines, Privilege, SupervisedChild};
    pub use crate::cli::{BlasterCli, TestTypeArg};
    pub use crate::config::{run_dir, Config, RunOptions};
    pub use crate::hooks::{StageHook, StageHooks};
    pub use crate::init::{init, LogSinks};
    pub use crate::progress::Progress;
    pub use crate::replay_binary::{tcpreplay_path, BLASTER_TCPREPLAY_PATH_ENV};
    pub use crate::run::{execute, run, RUN_SUMMARY_FILE};
    pub use crate::scheduler::TestScheduler;
    pub use crate::step::StepCoordinator;
    pub use crate::telemetry::{SpeedCheck, TelemetryLine, Verdict};
    pub use crate::types::BlasterResult;
    pub use crate::worker::{ReplayTask, ReplayWorker};
}
