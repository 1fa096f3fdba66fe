/// Raised when the replay binary reports a fatal error on its error stream.
///
/// The worker that saw the marker stops without restarting. The error is raised once the step
/// it happened in has finished, and ends the run.
#[derive(derive_more::Error, derive_more::Display, Debug, Clone, PartialEq)]
#[display("Step {step}: pcap file {workload_id} reported a fatal error: {line}")]
pub struct FatalTelemetryError {
    pub step: u32,
    pub workload_id: usize,
    pub line: String,
}

impl FatalTelemetryError {
    /// The marker that tcpreplay puts in front of errors it can't recover from.
    pub const MARKER: &'static str = "Fatal Error:";

    pub fn new(step: u32, workload_id: usize, line: impl Into<String>) -> Self {
        Self {
            step,
            workload_id,
            line: line.into(),
        }
    }

    /// Whether a line of error output carries the fatal marker.
    pub fn is_fatal_line(line: &str) -> bool {
        line.contains(Self::MARKER)
    }
}
