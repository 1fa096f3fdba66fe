//! Parsing of the `--stats` output of tcpreplay and the abnormal rate check built on top of it.

use std::time::{Duration, Instant};

use blaster_core::prelude::{RunPolicy, SpeedUnit};

/// Extra time a replay is given to reach its rate before its reports are trusted.
const WARM_UP_GRACE: Duration = Duration::from_secs(3);
/// Netmap needs longer to bring the interface up.
const NETMAP_WARM_UP_GRACE: Duration = Duration::from_secs(5);

/// A line of tcpreplay statistics output.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryLine {
    /// `Actual: <packets> packets (<bytes> bytes) sent in <seconds> seconds`
    Actual { elapsed_s: f64 },
    /// `Rated: <bps> Bps, <mbps> Mbps, <pps> pps`
    Rated { mbps: f64, pps: f64 },
    Other,
}

impl TelemetryLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Actual:") {
            let mut tokens = rest.split_whitespace().rev();
            // The last token is the unit, the one before it the elapsed seconds.
            return match (tokens.next(), tokens.next().map(str::parse::<f64>)) {
                (Some(_), Some(Ok(elapsed_s))) => TelemetryLine::Actual { elapsed_s },
                _ => TelemetryLine::Other,
            };
        }

        if let Some(rest) = line.strip_prefix("Rated:") {
            let mut mbps = None;
            let mut pps = None;
            for part in rest.split(',') {
                let mut tokens = part.split_whitespace();
                let (Some(value), Some(unit)) = (tokens.next(), tokens.next()) else {
                    continue;
                };
                let Ok(value) = value.parse::<f64>() else {
                    continue;
                };
                match unit {
                    "Mbps" => mbps = Some(value),
                    "pps" => pps = Some(value),
                    _ => {}
                }
            }
            return match (mbps, pps) {
                (Some(mbps), Some(pps)) => TelemetryLine::Rated { mbps, pps },
                _ => TelemetryLine::Other,
            };
        }

        TelemetryLine::Other
    }
}

/// Result of feeding a line to a [SpeedCheck].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Not a rate line, still warming up, or too soon after the previous check.
    Skipped,
    Stable { rate: f64 },
    Unstable { rate: f64 },
}

/// Watches the rates reported by one replay worker.
///
/// A `Rated:` line is only evaluated once the elapsed time reported by the latest `Actual:` line
/// has caught up with the wall clock time since the process started plus a warm-up grace, and
/// only if at least the check interval has passed since the previous evaluation. The interval
/// clock carries over restarts, the warm-up is per process.
#[derive(Debug)]
pub struct SpeedCheck {
    target: f64,
    threshold: f64,
    interval: Duration,
    grace: Duration,
    unit: SpeedUnit,
    last_actual: Option<Duration>,
    last_check: Instant,
}

impl SpeedCheck {
    pub fn new(
        target: f64,
        unit: SpeedUnit,
        policy: &RunPolicy,
        netmap: bool,
        started: Instant,
    ) -> Self {
        Self {
            target,
            threshold: policy.speed_threshold,
            interval: Duration::from_secs(policy.speed_check_interval),
            grace: if netmap {
                NETMAP_WARM_UP_GRACE
            } else {
                WARM_UP_GRACE
            },
            unit,
            last_actual: None,
            last_check: started,
        }
    }

    /// Forget what the previous process reported.
    pub fn restart(&mut self) {
        self.last_actual = None;
    }

    /// The rate at or above which a replay is considered unstable.
    pub fn limit(&self) -> f64 {
        self.target * self.threshold
    }

    /// Feed one line of output. `since_spawn` is the wall clock time since the current process was
    /// started.
    pub fn observe(&mut self, line: &str, since_spawn: Duration, now: Instant) -> Verdict {
        match TelemetryLine::parse(line) {
            TelemetryLine::Actual { elapsed_s } => {
                self.last_actual = Duration::try_from_secs_f64(elapsed_s).ok();
                Verdict::Skipped
            }
            TelemetryLine::Rated { mbps, pps } => {
                let warmed_up = self
                    .last_actual
                    .is_some_and(|reported| reported >= since_spawn + self.grace);
                if !warmed_up {
                    return Verdict::Skipped;
                }
                if now.saturating_duration_since(self.last_check) < self.interval {
                    return Verdict::Skipped;
                }

                self.last_check = now;
                let rate = match self.unit {
                    SpeedUnit::Pps => pps,
                    SpeedUnit::Mbps => mbps,
                };
                if rate >= self.limit() {
                    Verdict::Unstable { rate }
                } else {
                    Verdict::Stable { rate }
                }
            }
            TelemetryLine::Other => Verdict::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTUAL: &str = "Actual: 10000 packets (6400000 bytes) sent in 100.00 seconds";
    const RATED_FAST: &str = "Rated: 64000.0 Bps, 0.51 Mbps, 5000.00 pps";
    const RATED_OK: &str = "Rated: 64000.0 Bps, 0.51 Mbps, 1000.00 pps";

    fn check(started: Instant) -> SpeedCheck {
        SpeedCheck::new(
            1000.0,
            SpeedUnit::Pps,
            &RunPolicy::new(true, 3, 1.2),
            false,
            started,
        )
    }

    #[test]
    fn parse_actual() {
        assert_eq!(
            TelemetryLine::parse(ACTUAL),
            TelemetryLine::Actual { elapsed_s: 100.0 }
        );
    }

    #[test]
    fn parse_rated() {
        assert_eq!(
            TelemetryLine::parse(" Rated: 12500000.0 Bps, 100.00 Mbps, 12000.50 pps"),
            TelemetryLine::Rated {
                mbps: 100.0,
                pps: 12000.5
            }
        );
    }

    #[test]
    fn parse_other() {
        assert_eq!(
            TelemetryLine::parse("Test complete: 2024-01-01 12:00:00.123"),
            TelemetryLine::Other
        );
        assert_eq!(TelemetryLine::parse("Rated: garbage"), TelemetryLine::Other);
        assert_eq!(TelemetryLine::parse("Actual:"), TelemetryLine::Other);
    }

    #[test]
    fn abnormal_rate_is_unstable() {
        let started = Instant::now();
        let mut check = check(started);
        let now = started + Duration::from_secs(5);

        assert_eq!(check.observe(ACTUAL, Duration::from_secs(5), now), Verdict::Skipped);
        assert_eq!(
            check.observe(RATED_FAST, Duration::from_secs(5), now),
            Verdict::Unstable { rate: 5000.0 }
        );
    }

    #[test]
    fn normal_rate_is_stable() {
        let started = Instant::now();
        let mut check = check(started);
        let now = started + Duration::from_secs(5);

        check.observe(ACTUAL, Duration::from_secs(5), now);
        assert_eq!(
            check.observe(RATED_OK, Duration::from_secs(5), now),
            Verdict::Stable { rate: 1000.0 }
        );
    }

    #[test]
    fn rated_before_warm_up_is_skipped() {
        let started = Instant::now();
        let mut check = check(started);
        let now = started + Duration::from_secs(10);

        // No Actual line yet.
        assert_eq!(check.observe(RATED_FAST, Duration::from_secs(10), now), Verdict::Skipped);

        // Reported elapsed is behind wall clock plus grace.
        check.observe(
            "Actual: 1 packets (64 bytes) sent in 12.00 seconds",
            Duration::from_secs(10),
            now,
        );
        assert_eq!(check.observe(RATED_FAST, Duration::from_secs(10), now), Verdict::Skipped);

        check.observe(
            "Actual: 1 packets (64 bytes) sent in 13.00 seconds",
            Duration::from_secs(10),
            now,
        );
        assert!(matches!(
            check.observe(RATED_FAST, Duration::from_secs(10), now),
            Verdict::Unstable { .. }
        ));
    }

    #[test]
    fn netmap_needs_longer_warm_up() {
        let started = Instant::now();
        let mut check = SpeedCheck::new(
            1000.0,
            SpeedUnit::Pps,
            &RunPolicy::new(true, 1, 1.2),
            true,
            started,
        );
        let now = started + Duration::from_secs(10);

        check.observe(
            "Actual: 1 packets (64 bytes) sent in 14.00 seconds",
            Duration::from_secs(10),
            now,
        );
        assert_eq!(check.observe(RATED_FAST, Duration::from_secs(10), now), Verdict::Skipped);
    }

    #[test]
    fn checks_are_spaced_by_the_interval() {
        let started = Instant::now();
        let mut check = check(started);

        // Too soon after start.
        let early = started + Duration::from_secs(2);
        check.observe(ACTUAL, Duration::from_secs(2), early);
        assert_eq!(check.observe(RATED_FAST, Duration::from_secs(2), early), Verdict::Skipped);

        let first = started + Duration::from_secs(3);
        assert_eq!(
            check.observe(RATED_OK, Duration::from_secs(3), first),
            Verdict::Stable { rate: 1000.0 }
        );

        // The stable evaluation resets the interval clock.
        let second = first + Duration::from_secs(2);
        assert_eq!(check.observe(RATED_FAST, Duration::from_secs(5), second), Verdict::Skipped);

        let third = first + Duration::from_secs(3);
        assert!(matches!(
            check.observe(RATED_FAST, Duration::from_secs(6), third),
            Verdict::Unstable { .. }
        ));
    }

    #[test]
    fn mbps_mode_reads_mbps() {
        let started = Instant::now();
        let mut check = SpeedCheck::new(
            0.5,
            SpeedUnit::Mbps,
            &RunPolicy::new(true, 1, 1.2),
            false,
            started,
        );
        let now = started + Duration::from_secs(1);

        check.observe(ACTUAL, Duration::from_secs(1), now);
        assert_eq!(
            check.observe(RATED_FAST, Duration::from_secs(1), now),
            Verdict::Stable { rate: 0.51 }
        );
    }

    #[test]
    fn restart_forgets_reported_elapsed() {
        let started = Instant::now();
        let mut check = check(started);
        let now = started + Duration::from_secs(5);

        check.observe(ACTUAL, Duration::from_secs(5), now);
        check.restart();
        assert_eq!(check.observe(RATED_FAST, Duration::from_secs(0), now), Verdict::Skipped);
    }
}
