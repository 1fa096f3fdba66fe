mod capture;
mod error;
mod fatal;
mod loops;
mod model;
mod plan;

pub use loops::unique_ip_loops;

pub mod prelude {
    pub use crate::capture::SessionStatistics;
    pub use crate::error::{CaptureError, ConfigError, SetupError};
    pub use crate::fatal::FatalTelemetryError;
    pub use crate::model::{BaseSpeed, ReplayArg, RunPolicy, SpeedUnit, Workload, WorkloadSet};
    pub use crate::plan::{PlanKind, SpikeOverride, Step, StepPhase, TestPlan, TestType};
}
