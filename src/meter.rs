use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::protocol::Reading;

/// Watt-seconds per kilowatt-hour.
const WS_PER_KWH: f64 = 3_600_000.0;

/// Running meter-reading state for one capture session.
///
/// Summation readings are authoritative but arrive rarely; demand readings
/// arrive every few seconds and are integrated forward from the last
/// authoritative value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MeterState {
    /// At least one summation has been accepted.
    pub has_actual_reading: bool,
    /// A summation differing from the first one has been accepted.
    pub has_fresh_actual: bool,
    /// Net energy (kWh) of the last accepted summation.
    pub baseline_energy_kwh: f64,
    /// Running energy total (kWh), advanced by each demand reading.
    pub last_actual_energy_kwh: f64,
    /// Device time the running total refers to.
    pub last_reading_time_s: u32,
    /// Device time of the last accepted summation.
    pub last_summation_time_s: u32,
}

/// Interpolated meter reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub approx_kwh: f64,
    pub last_actual_kwh: f64,
    /// The baseline is the first summation seen since start-up.
    pub stale: bool,
}

/// What the capture loop should do with a reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// New baseline; persist it.
    Summation { at: DateTime<Utc>, kwh: f64 },
    /// Same meter value as the current baseline; drop it.
    RepeatedSummation,
    /// Persist the demand; `estimate` is `None` until a baseline exists.
    Demand {
        at: DateTime<Utc>,
        watts: f64,
        estimate: Option<Estimate>,
    },
}

impl MeterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current running total, if a baseline exists.
    pub fn approximate_kwh(&self) -> Option<f64> {
        self.has_actual_reading.then_some(self.last_actual_energy_kwh)
    }

    pub fn observe(&mut self, reading: &Reading) -> Observation {
        match *reading {
            Reading::Summation {
                at,
                at_seconds,
                delivered_wh,
                received_wh,
            } => self.observe_summation(at, at_seconds, (delivered_wh - received_wh) / 1000.0),
            Reading::Demand {
                at,
                at_seconds,
                watts,
            } => self.observe_demand(at, at_seconds, watts),
        }
    }

    fn observe_summation(&mut self, at: DateTime<Utc>, at_seconds: u32, net_kwh: f64) -> Observation {
        if !self.has_actual_reading {
            self.has_actual_reading = true;
            self.baseline_energy_kwh = net_kwh;
            self.last_actual_energy_kwh = net_kwh;
            self.last_reading_time_s = at_seconds;
            self.last_summation_time_s = at_seconds;
            info!("Meter reading: {}kWh (possibly stale reading)", net_kwh);
            return Observation::Summation { at, kwh: net_kwh };
        }

        if net_kwh == self.baseline_energy_kwh || at_seconds <= self.last_summation_time_s {
            info!("Ignoring repeated meter reading: {}kWh", net_kwh);
            return Observation::RepeatedSummation;
        }

        self.has_fresh_actual = true;
        self.baseline_energy_kwh = net_kwh;
        self.last_actual_energy_kwh = net_kwh;
        // Integration restarts at the summation's own time, even if a later
        // demand has already been counted.
        self.last_reading_time_s = at_seconds;
        self.last_summation_time_s = at_seconds;
        info!("Actual meter reading: {}kWh", net_kwh);
        Observation::Summation { at, kwh: net_kwh }
    }

    fn observe_demand(&mut self, at: DateTime<Utc>, at_seconds: u32, watts: f64) -> Observation {
        info!("Current usage: {}W", watts);

        if !self.has_actual_reading {
            debug!("Meter not yet read");
            return Observation::Demand {
                at,
                watts,
                estimate: None,
            };
        }

        // Out-of-order demand contributes no elapsed time.
        let elapsed = at_seconds.saturating_sub(self.last_reading_time_s);
        let approx_kwh = self.last_actual_energy_kwh + f64::from(elapsed) * watts / WS_PER_KWH;
        self.last_actual_energy_kwh = approx_kwh;
        self.last_reading_time_s = self.last_reading_time_s.max(at_seconds);

        let estimate = Estimate {
            approx_kwh,
            last_actual_kwh: self.baseline_energy_kwh,
            stale: !self.has_fresh_actual,
        };
        if estimate.stale {
            info!(
                "Approximate meter reading: {}kWh, but based on possibly stale meter reading",
                approx_kwh
            );
            info!(
                "Last actual meter reading: {}kWh (possibly stale reading)",
                self.baseline_energy_kwh
            );
        } else {
            info!("Approximate meter reading: {}kWh", approx_kwh);
            info!("Last actual meter reading: {}kWh", self.baseline_energy_kwh);
        }

        Observation::Demand {
            at,
            watts,
            estimate: Some(estimate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::device_time;

    fn demand(at_seconds: u32, watts: f64) -> Reading {
        Reading::Demand {
            at: device_time(at_seconds).unwrap(),
            at_seconds,
            watts,
        }
    }

    fn summation(at_seconds: u32, delivered_wh: f64, received_wh: f64) -> Reading {
        Reading::Summation {
            at: device_time(at_seconds).unwrap(),
            at_seconds,
            delivered_wh,
            received_wh,
        }
    }

    #[test]
    fn demand_before_summation_has_no_estimate() {
        let mut state = MeterState::new();
        match state.observe(&demand(100, 450.0)) {
            Observation::Demand {
                watts, estimate, ..
            } => {
                assert_eq!(watts, 450.0);
                assert_eq!(estimate, None);
            }
            other => panic!("expected demand, got {:?}", other),
        }
        assert_eq!(state, MeterState::new());
        assert_eq!(state.approximate_kwh(), None);
    }

    #[test]
    fn first_summation_is_stale_baseline() {
        let mut state = MeterState::new();
        let obs = state.observe(&summation(100, 20_060_767.0, 1000.0));
        assert_eq!(
            obs,
            Observation::Summation {
                at: device_time(100).unwrap(),
                kwh: 20_059.767
            }
        );
        assert!(state.has_actual_reading);
        assert!(!state.has_fresh_actual);
        assert_eq!(state.baseline_energy_kwh, 20_059.767);
        assert_eq!(state.last_actual_energy_kwh, 20_059.767);
        assert_eq!(state.last_reading_time_s, 100);
    }

    #[test]
    fn identical_summations_are_not_repeated() {
        let mut state = MeterState::new();
        state.observe(&summation(100, 5000.0, 0.0));
        let before = state.clone();
        assert_eq!(
            state.observe(&summation(200, 5000.0, 0.0)),
            Observation::RepeatedSummation
        );
        assert_eq!(state, before);
    }

    #[test]
    fn repeat_is_detected_against_baseline_after_demand() {
        let mut state = MeterState::new();
        state.observe(&summation(100, 5000.0, 0.0));
        state.observe(&demand(136, 1000.0));
        assert!(matches!(
            state.observe(&summation(140, 5000.0, 0.0)),
            Observation::RepeatedSummation
        ));
    }

    #[test]
    fn older_summation_is_a_repeat() {
        let mut state = MeterState::new();
        state.observe(&summation(100, 5000.0, 0.0));
        assert!(matches!(
            state.observe(&summation(100, 6000.0, 0.0)),
            Observation::RepeatedSummation
        ));
        assert!(matches!(
            state.observe(&summation(90, 6000.0, 0.0)),
            Observation::RepeatedSummation
        ));
        assert!(!state.has_fresh_actual);
    }

    #[test]
    fn changed_summation_is_fresh() {
        let mut state = MeterState::new();
        state.observe(&summation(100, 5000.0, 0.0));
        let obs = state.observe(&summation(400, 5100.0, 50.0));
        assert_eq!(
            obs,
            Observation::Summation {
                at: device_time(400).unwrap(),
                kwh: 5.05
            }
        );
        assert!(state.has_fresh_actual);
        assert_eq!(state.baseline_energy_kwh, 5.05);
        assert_eq!(state.last_reading_time_s, 400);
    }

    #[test]
    fn demand_after_first_summation_is_stale_estimate() {
        let mut state = MeterState::new();
        state.observe(&summation(100, 5000.0, 0.0));
        match state.observe(&demand(136, 1000.0)) {
            Observation::Demand {
                estimate: Some(estimate),
                ..
            } => {
                assert!(estimate.stale);
                assert!((estimate.approx_kwh - (5.0 + 36.0 * 1000.0 / 3_600_000.0)).abs() < 1e-12);
                assert_eq!(estimate.last_actual_kwh, 5.0);
            }
            other => panic!("expected estimate, got {:?}", other),
        }
        assert_eq!(state.last_reading_time_s, 136);
    }

    #[test]
    fn constant_demand_accumulates_per_tick() {
        let mut state = MeterState::new();
        state.observe(&summation(100, 5000.0, 0.0));
        state.observe(&summation(200, 7000.0, 0.0));
        assert!(state.has_fresh_actual);

        let watts = 1234.5;
        let mut expected = 7.0;
        let mut last = 200u32;
        for tick in 1..=10u32 {
            let at = 200 + tick * 8;
            expected += f64::from(at - last) * watts / 3_600_000.0;
            last = at;
            match state.observe(&demand(at, watts)) {
                Observation::Demand {
                    estimate: Some(estimate),
                    ..
                } => {
                    assert!(!estimate.stale);
                    assert_eq!(estimate.approx_kwh, expected);
                    assert_eq!(estimate.last_actual_kwh, 7.0);
                }
                other => panic!("expected estimate, got {:?}", other),
            }
        }
        assert_eq!(state.approximate_kwh(), Some(expected));
        assert!((expected - (7.0 + watts * 80.0 / 3_600_000.0)).abs() < 1e-9);
    }

    #[test]
    fn negative_demand_reduces_estimate() {
        let mut state = MeterState::new();
        state.observe(&summation(100, 5000.0, 0.0));
        state.observe(&demand(3700, -500.0));
        assert!((state.last_actual_energy_kwh - 4.5).abs() < 1e-12);
    }

    #[test]
    fn out_of_order_demand_does_not_rewind_time() {
        let mut state = MeterState::new();
        state.observe(&summation(100, 5000.0, 0.0));
        state.observe(&demand(200, 1000.0));
        let before = state.last_actual_energy_kwh;
        state.observe(&demand(150, 1000.0));
        assert_eq!(state.last_reading_time_s, 200);
        assert_eq!(state.last_actual_energy_kwh, before);
    }

    #[test]
    fn fresh_summation_restarts_integration_at_its_own_time() {
        let mut state = MeterState::new();
        state.observe(&summation(100, 5000.0, 0.0));
        state.observe(&demand(200, 1000.0));
        state.observe(&summation(190, 6000.0, 0.0));
        assert_eq!(state.last_reading_time_s, 190);

        state.observe(&demand(226, 1000.0));
        let expected = 6.0 + 36.0 * 1000.0 / 3_600_000.0;
        assert!((state.last_actual_energy_kwh - expected).abs() < 1e-12);
    }
}
