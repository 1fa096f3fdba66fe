//! Derives the `--unique-ip-loops` value for a workload.
//!
//! The replay binary re-randomises addresses every `loop_count` loops, so the number of distinct
//! sessions seen per minute is `sessions_per_loop * loops_per_minute / loop_count`. The loop count
//! is chosen so that this lands on the workload's share of the target session rate.

use crate::capture::SessionStatistics;
use crate::error::{ConfigError, SetupError};
use crate::model::{BaseSpeed, SpeedUnit, WorkloadSet};

/// Calculate the unique IP loop count for one workload.
///
/// `total_sessions_per_min` is the target across all workloads at 100% load and `percentage` is
/// this workload's share of it. The result is never below 1.
pub fn unique_ip_loops(
    stats: &SessionStatistics,
    base_speed: BaseSpeed,
    total_sessions_per_min: u64,
    percentage: f64,
) -> Result<u64, ConfigError> {
    let share = percentage / 100.0;
    let speed = base_speed.value * share;
    let target_sessions = (total_sessions_per_min as f64 * share).floor();

    if target_sessions < 1.0 {
        return Err(ConfigError::Invalid {
            field: "total_sessions_per_min",
            reason: format!(
                "{total_sessions_per_min} sessions per minute at {percentage}% leaves no sessions for this pcap"
            ),
        });
    }

    let loops_per_minute = match base_speed.unit {
        SpeedUnit::Pps => {
            if stats.packets_per_loop == 0 {
                return Err(empty_capture());
            }
            (speed * 60.0) / stats.packets_per_loop as f64
        }
        SpeedUnit::Mbps => {
            if stats.bytes_per_loop == 0 {
                return Err(empty_capture());
            }
            (speed * 1_000_000.0 * 60.0) / (stats.bytes_per_loop as f64 * 8.0)
        }
    };

    let sessions_per_minute = stats.sessions_per_loop as f64 * loops_per_minute;

    let mut loop_count = ((sessions_per_minute / target_sessions).floor() as u64).max(1);

    // A single step back when the floor undershoots the target.
    if sessions_per_minute / (loop_count as f64) < target_sessions {
        loop_count = loop_count.saturating_sub(1).max(1);
    }

    Ok(loop_count)
}

fn empty_capture() -> ConfigError {
    ConfigError::Invalid {
        field: "file",
        reason: "the capture contains no packets".to_string(),
    }
}

impl WorkloadSet {
    /// Fill in the loop count of every workload that doesn't have one configured.
    ///
    /// With a target session rate the capture is scanned and the count derived from it. Without
    /// one the loop count is 0, which disables unique IP looping and percentage scaling.
    pub fn resolve_loop_counts(
        &mut self,
        base_speed: BaseSpeed,
        total_sessions_per_min: Option<u64>,
    ) -> Result<(), SetupError> {
        for workload in self.iter_mut().filter(|w| w.loop_count.is_none()) {
            match total_sessions_per_min {
                Some(total) => {
                    let stats = match workload.session_statistics {
                        Some(stats) => stats,
                        None => SessionStatistics::scan(&workload.file)?,
                    };
                    let loops = unique_ip_loops(&stats, base_speed, total, workload.percentage)?;
                    log::info!(
                        "Calculated {loops} unique IP loops for {}",
                        workload.file.display()
                    );
                    workload.session_statistics = Some(stats);
                    workload.loop_count = Some(loops);
                }
                None => {
                    workload.loop_count = Some(0);
                    workload.percent_scaled_loops = false;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::capture::test_capture::{build, Frame};
    use crate::model::Workload;

    fn stats(packets: u64, bytes: u64, sessions: u64) -> SessionStatistics {
        SessionStatistics {
            packets_per_loop: packets,
            bytes_per_loop: bytes,
            sessions_per_loop: sessions,
        }
    }

    #[test]
    fn half_share_of_pps_target() {
        // 500 pps over 1000 packet loops is 30 loops per minute, 3000 sessions per minute against
        // a target of 300.
        let loops = unique_ip_loops(&stats(1000, 0, 100), BaseSpeed::pps(1000.0), 600, 50.0)
            .expect("valid input");
        assert_eq!(loops, 10);
    }

    #[test]
    fn mbps_uses_bytes_per_loop() {
        // 8 Mbps is 1,000,000 bytes per second, 60 loops per minute of a 1,000,000 byte capture.
        let loops = unique_ip_loops(&stats(10, 1_000_000, 50), BaseSpeed::mbps(8.0), 1000, 100.0)
            .expect("valid input");
        assert_eq!(loops, 3);
    }

    #[test]
    fn floor_keeps_rate_at_or_above_target() {
        // 60 loops per minute of 7 sessions is 420 per minute against a target of 100.
        let loops = unique_ip_loops(&stats(60, 0, 7), BaseSpeed::pps(60.0), 100, 100.0)
            .expect("valid input");
        assert_eq!(loops, 4);
        assert!(420.0 / loops as f64 >= 100.0);
    }

    #[test]
    fn undershoot_stays_at_one() {
        // 60 sessions per minute can't reach 300, the correction is floored at 1.
        let loops = unique_ip_loops(&stats(60, 0, 1), BaseSpeed::pps(60.0), 300, 100.0)
            .expect("valid input");
        assert_eq!(loops, 1);
    }

    #[test]
    fn never_below_one() {
        for (sessions, target) in [(0, 10), (1, 1_000_000), (5, 7), (100, 100)] {
            let loops =
                unique_ip_loops(&stats(100, 100, sessions), BaseSpeed::pps(1.0), target, 100.0)
                    .expect("valid input");
            assert!(loops >= 1, "sessions={sessions}, target={target} gave {loops}");
        }
    }

    #[test]
    fn empty_capture_is_an_error() {
        let result = unique_ip_loops(&stats(0, 0, 0), BaseSpeed::pps(1000.0), 600, 100.0);
        assert!(matches!(result, Err(ConfigError::Invalid { field: "file", .. })));
    }

    #[test]
    fn zero_session_target_is_an_error() {
        let result = unique_ip_loops(&stats(10, 10, 10), BaseSpeed::pps(1000.0), 1, 50.0);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "total_sessions_per_min",
                ..
            })
        ));
    }

    #[test]
    fn resolve_without_session_target_disables_looping() {
        let mut set = WorkloadSet::new(
            vec![Workload::new(0, "/does/not/matter.pcap", "eth0").with_percent_scaled_loops(true)],
            false,
        )
        .expect("valid workloads");

        set.resolve_loop_counts(BaseSpeed::pps(100.0), None)
            .expect("no capture is read");

        let w = set.iter().next().expect("one workload");
        assert_eq!(w.loop_count, Some(0));
        assert!(!w.percent_scaled_loops);
    }

    #[test]
    fn resolve_keeps_explicit_loop_count() {
        let mut set = WorkloadSet::new(
            vec![Workload::new(0, "/does/not/matter.pcap", "eth0").with_loop_count(7)],
            false,
        )
        .expect("valid workloads");

        set.resolve_loop_counts(BaseSpeed::pps(100.0), Some(1000))
            .expect("no capture is read");

        assert_eq!(set.iter().next().and_then(|w| w.loop_count), Some(7));
    }

    #[test]
    fn resolve_scans_the_capture() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("flows.pcap");
        let frames: Vec<Frame> = (0..10u16)
            .map(|port| {
                Frame::Udp(
                    "10.0.0.1".parse().expect("ip"),
                    port,
                    "10.0.0.2".parse().expect("ip"),
                    53,
                )
            })
            .collect();
        std::fs::write(&path, build(&frames)).expect("write capture");

        let mut set = WorkloadSet::new(vec![Workload::new(0, &path, "eth0")], false)
            .expect("valid workloads");

        // 100 pps over 10 packets is 600 loops per minute, 6000 sessions per minute.
        set.resolve_loop_counts(BaseSpeed::pps(100.0), Some(600))
            .expect("capture is readable");

        let w = set.iter().next().expect("one workload");
        assert_eq!(w.loop_count, Some(10));
        assert_eq!(w.session_statistics.map(|s| s.sessions_per_loop), Some(10));
    }

    #[test]
    fn resolve_reports_unreadable_capture() {
        let mut set = WorkloadSet::new(vec![Workload::new(0, "/non/existent.pcap", "eth0")], false)
            .expect("valid workloads");

        let result = set.resolve_loop_counts(BaseSpeed::pps(100.0), Some(600));
        assert!(matches!(result, Err(SetupError::Capture(_))));
    }
}
