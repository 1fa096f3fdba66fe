/// Error type for the runner and the `pcap-blaster` binary. Setup errors from `blaster_core`
/// convert into it so they can be propagated with `?`.
pub type BlasterResult<T> = anyhow::Result<T>;
