//! Access-policy selector
//!
//! Decides whether a terminal's assignment needs recomputing and, if so,
//! which candidate satellite to assign. Ranking, highest priority first:
//!
//! 1. orbital-direction affinity with the serving satellite (within tolerance);
//!    if no candidate is aligned, the full covering set is ranked instead
//! 2. consistent policy only: longest remaining coverage, up to the horizon
//! 3. link quality (estimator score, or elevation angle)
//! 4. lowest satellite id

use crate::config::EngineConfig;
use crate::deadline::GuardedOracle;
use crate::quality::LinkQualityEstimator;
use crate::snapshot::{angle_between_deg, SatelliteState};
use crate::{AccessPolicy, HandoverError, Result, Terminal};
use chrono::{DateTime, Duration, Utc};
use nalgebra::Vector3;
use orbital_mechanics::{GeodeticPosition, LookAngles};
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub satellite_id: String,
    pub quality: f64,
    pub elevation_deg: f64,
    pub aligned: bool,
    pub remaining: Option<Duration>,
    /// Covering candidates seen before direction filtering
    pub considered: usize,
}

struct Scored<'s> {
    state: &'s SatelliteState,
    look: LookAngles,
    aligned: bool,
    quality: f64,
    remaining: Option<Duration>,
}

pub struct Selector<'a> {
    config: &'a EngineConfig,
    oracle: GuardedOracle<'a>,
    estimator: Option<&'a dyn LinkQualityEstimator>,
}

impl<'a> Selector<'a> {
    pub fn new(
        config: &'a EngineConfig,
        oracle: GuardedOracle<'a>,
        estimator: Option<&'a dyn LinkQualityEstimator>,
    ) -> Self {
        Self {
            config,
            oracle,
            estimator,
        }
    }

    pub fn covers(&self, terminal: &Terminal, satellite_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let ground = terminal.position_at(at);
        let look = self.oracle.look_angles(&ground, satellite_id, at)?;
        Ok(look.elevation_deg >= self.config.min_elevation_deg)
    }

    /// Consistent terminals are always re-evaluated; flexible ones only once
    /// the serving satellite stops covering them.
    pub fn needs_reevaluation(
        &self,
        terminal: &Terminal,
        current: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        match (terminal.policy, current) {
            (AccessPolicy::Consistent, _) => Ok(true),
            (AccessPolicy::Flexible, None) => Ok(true),
            (AccessPolicy::Flexible, Some(sat)) => Ok(!self.covers(terminal, sat, at)?),
        }
    }

    /// Whether the terminal keeps `current` at `at` under its policy.
    pub fn retains(&self, terminal: &Terminal, current: &str, at: DateTime<Utc>) -> Result<bool> {
        if !self.covers(terminal, current, at)? {
            return Ok(false);
        }
        match terminal.policy {
            AccessPolicy::Flexible => Ok(true),
            AccessPolicy::Consistent => {
                let until = at + self.config.consistent.lock_in();
                self.covers(terminal, current, until)
            }
        }
    }

    /// Coverage left after `from`, probed in fixed steps up to the horizon.
    /// Assumes the satellite covers the terminal at `from`.
    pub fn remaining_coverage(
        &self,
        terminal: &Terminal,
        satellite_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Duration> {
        let step = self.config.consistent.probe_step();
        let horizon = self.config.consistent.horizon();
        let mut covered = Duration::zero();
        loop {
            let next = covered + step;
            if next > horizon {
                return Ok(horizon);
            }
            if !self.covers(terminal, satellite_id, from + next)? {
                return Ok(covered);
            }
            covered = next;
        }
    }

    /// Full assignment decision at a single instant
    pub fn assign(
        &self,
        terminal: &Terminal,
        current: Option<&str>,
        serving_direction: Option<&Vector3<f64>>,
        candidates: &[&SatelliteState],
        at: DateTime<Utc>,
    ) -> Result<String> {
        if let Some(sat) = current {
            if !self.needs_reevaluation(terminal, Some(sat), at)? {
                return Ok(sat.to_string());
            }
            if terminal.policy == AccessPolicy::Consistent && self.retains(terminal, sat, at)? {
                return Ok(sat.to_string());
            }
        }
        self.select(terminal, serving_direction, candidates, at)
            .map(|s| s.satellite_id)
    }

    /// Assignment at an instant inside a prediction window. The source is
    /// kept for as long as it covers the terminal, whatever the policy, so a
    /// switch made by choice lands on the window end and a forced one on the
    /// coverage edge. `None` when nothing covers.
    pub fn assign_within_window(
        &self,
        terminal: &Terminal,
        source: &str,
        serving_direction: Option<&Vector3<f64>>,
        candidates: &[&SatelliteState],
        at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        if self.covers(terminal, source, at)? {
            return Ok(Some(source.to_string()));
        }
        match self.select(terminal, serving_direction, candidates, at) {
            Ok(selection) => Ok(Some(selection.satellite_id)),
            Err(HandoverError::NoCoverage(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Rank the covering candidates and return the best one
    pub fn select(
        &self,
        terminal: &Terminal,
        serving_direction: Option<&Vector3<f64>>,
        candidates: &[&SatelliteState],
        at: DateTime<Utc>,
    ) -> Result<Selection> {
        let ground = terminal.position_at(at);
        let tolerance = self.config.direction_tolerance_degrees;

        let mut scored = Vec::new();
        for &state in candidates {
            let look = self.oracle.look_angles(&ground, &state.id, at)?;
            if look.elevation_deg < self.config.min_elevation_deg {
                continue;
            }
            let aligned = match (serving_direction, state.direction.as_ref()) {
                (Some(serving), Some(dir)) => angle_between_deg(serving, dir) <= tolerance,
                _ => false,
            };
            scored.push(Scored {
                state,
                look,
                aligned,
                quality: 0.0,
                remaining: None,
            });
        }

        if scored.is_empty() {
            return Err(HandoverError::NoCoverage(terminal.id.clone()));
        }
        let considered = scored.len();

        if scored.iter().any(|c| c.aligned) {
            scored.retain(|c| c.aligned);
        }

        for c in scored.iter_mut() {
            c.quality = self.quality(&ground, c.state, &c.look, at)?;
            if terminal.policy == AccessPolicy::Consistent {
                c.remaining = Some(self.remaining_coverage(terminal, &c.state.id, at)?);
            }
        }

        scored.sort_by(|a, b| {
            b.remaining
                .cmp(&a.remaining)
                .then(b.quality.partial_cmp(&a.quality).unwrap_or(Ordering::Equal))
                .then_with(|| a.state.id.cmp(&b.state.id))
        });

        let best = &scored[0];
        debug!(
            "{} ({}) -> {} (q={:.2}, el={:.1}, aligned={}, of {})",
            terminal.id,
            terminal.policy,
            best.state.id,
            best.quality,
            best.look.elevation_deg,
            best.aligned,
            considered
        );

        Ok(Selection {
            satellite_id: best.state.id.clone(),
            quality: best.quality,
            elevation_deg: best.look.elevation_deg,
            aligned: best.aligned,
            remaining: best.remaining,
            considered,
        })
    }

    fn quality(
        &self,
        ground: &GeodeticPosition,
        state: &SatelliteState,
        look: &LookAngles,
        at: DateTime<Utc>,
    ) -> Result<f64> {
        match self.estimator {
            Some(estimator) => Ok(estimator.quality(ground, &state.id, at)?),
            None => Ok(look.elevation_deg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::Deadline;
    use crate::{Mobility, Terminal};
    use chrono::TimeZone;
    use orbital_mechanics::{OracleError, OrbitOracle, SatelliteInfo};
    use std::collections::HashMap;

    /// Fixed elevations per satellite, constant over time
    struct StaticOracle {
        elevations: HashMap<String, f64>,
    }

    impl OrbitOracle for StaticOracle {
        fn catalog(&self) -> Vec<SatelliteInfo> {
            Vec::new()
        }

        fn position(&self, id: &str, _t: DateTime<Utc>) -> std::result::Result<GeodeticPosition, OracleError> {
            if self.elevations.contains_key(id) {
                Ok(GeodeticPosition::new(0.0, 0.0, 550.0))
            } else {
                Err(OracleError::UnknownSatellite(id.to_string()))
            }
        }

        fn look_angles(
            &self,
            _ground: &GeodeticPosition,
            id: &str,
            _t: DateTime<Utc>,
        ) -> std::result::Result<LookAngles, OracleError> {
            let elevation_deg = *self
                .elevations
                .get(id)
                .ok_or_else(|| OracleError::UnknownSatellite(id.to_string()))?;
            Ok(LookAngles {
                elevation_deg,
                azimuth_deg: 0.0,
                range_km: 1000.0,
            })
        }
    }

    fn make_oracle(els: &[(&str, f64)]) -> StaticOracle {
        StaticOracle {
            elevations: els.iter().map(|(id, el)| (id.to_string(), *el)).collect(),
        }
    }

    fn make_state(id: &str, direction: [f64; 3]) -> SatelliteState {
        SatelliteState {
            id: id.to_string(),
            constellation: "leo".to_string(),
            position: GeodeticPosition::new(0.0, 0.0, 550.0),
            direction: Vector3::new(direction[0], direction[1], direction[2]).try_normalize(1e-12),
        }
    }

    fn make_terminal(policy: AccessPolicy) -> Terminal {
        Terminal {
            id: "U1".to_string(),
            mobility: Mobility::fixed(GeodeticPosition::ground(0.0, 0.0)),
            serving_satellite: None,
            policy,
            last_report_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn make_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_prefers_aligned_over_stronger() {
        let config = EngineConfig::default();
        let oracle = make_oracle(&[("S2", 40.0), ("S3", 80.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);

        let s2 = make_state("S2", [1.0, 0.0, 0.0]);
        let s3 = make_state("S3", [0.0, 1.0, 0.0]);
        let serving = Vector3::new(1.0, 0.1, 0.0).normalize();

        let sel = selector
            .select(&make_terminal(AccessPolicy::Flexible), Some(&serving), &[&s2, &s3], make_time())
            .unwrap();
        assert_eq!(sel.satellite_id, "S2");
        assert!(sel.aligned);
        assert_eq!(sel.considered, 2);
    }

    #[test]
    fn test_falls_back_to_full_set_when_none_aligned() {
        let config = EngineConfig::default();
        let oracle = make_oracle(&[("S2", 40.0), ("S3", 80.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);

        let s2 = make_state("S2", [0.0, 0.0, 1.0]);
        let s3 = make_state("S3", [0.0, 1.0, 0.0]);
        let serving = Vector3::new(1.0, 0.0, 0.0);

        let sel = selector
            .select(&make_terminal(AccessPolicy::Flexible), Some(&serving), &[&s2, &s3], make_time())
            .unwrap();
        assert_eq!(sel.satellite_id, "S3");
        assert!(!sel.aligned);
    }

    #[test]
    fn test_ties_break_on_lowest_id() {
        let config = EngineConfig::default();
        let oracle = make_oracle(&[("S9", 50.0), ("S10", 50.0), ("S5", 50.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);

        let a = make_state("S9", [1.0, 0.0, 0.0]);
        let b = make_state("S10", [1.0, 0.0, 0.0]);
        let c = make_state("S5", [1.0, 0.0, 0.0]);
        let sel = selector
            .select(&make_terminal(AccessPolicy::Flexible), None, &[&a, &b, &c], make_time())
            .unwrap();
        assert_eq!(sel.satellite_id, "S10");
    }

    #[test]
    fn test_no_coverage() {
        let config = EngineConfig::default();
        let oracle = make_oracle(&[("S1", 2.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);
        let s1 = make_state("S1", [1.0, 0.0, 0.0]);

        let err = selector
            .select(&make_terminal(AccessPolicy::Flexible), None, &[&s1], make_time())
            .unwrap_err();
        assert_eq!(err, HandoverError::NoCoverage("U1".to_string()));
    }

    #[test]
    fn test_flexible_skips_reevaluation_while_covered() {
        let config = EngineConfig::default();
        let oracle = make_oracle(&[("S1", 15.0), ("S2", 80.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);
        let s2 = make_state("S2", [1.0, 0.0, 0.0]);

        let flexible = make_terminal(AccessPolicy::Flexible);
        assert!(!selector.needs_reevaluation(&flexible, Some("S1"), make_time()).unwrap());
        assert_eq!(
            selector.assign(&flexible, Some("S1"), None, &[&s2], make_time()).unwrap(),
            "S1"
        );

        let consistent = make_terminal(AccessPolicy::Consistent);
        assert!(selector.needs_reevaluation(&consistent, Some("S1"), make_time()).unwrap());
    }

    #[test]
    fn test_consistent_keeps_long_lived_current() {
        let config = EngineConfig::default();
        let oracle = make_oracle(&[("S1", 15.0), ("S2", 80.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);
        let s2 = make_state("S2", [1.0, 0.0, 0.0]);

        // static geometry: S1 covers forever, so lock-in holds
        let consistent = make_terminal(AccessPolicy::Consistent);
        assert_eq!(
            selector.assign(&consistent, Some("S1"), None, &[&s2], make_time()).unwrap(),
            "S1"
        );
    }

    #[test]
    fn test_window_probe_keeps_covering_source() {
        let config = EngineConfig::default();
        let s2 = make_state("S2", [1.0, 0.0, 0.0]);
        let consistent = make_terminal(AccessPolicy::Consistent);

        let oracle = make_oracle(&[("S1", 15.0), ("S2", 80.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);
        assert_eq!(
            selector
                .assign_within_window(&consistent, "S1", None, &[&s2], make_time())
                .unwrap(),
            Some("S1".to_string())
        );

        let oracle = make_oracle(&[("S1", 5.0), ("S2", 80.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);
        assert_eq!(
            selector
                .assign_within_window(&consistent, "S1", None, &[&s2], make_time())
                .unwrap(),
            Some("S2".to_string())
        );

        let oracle = make_oracle(&[("S1", 5.0), ("S2", 2.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);
        assert_eq!(
            selector
                .assign_within_window(&consistent, "S1", None, &[&s2], make_time())
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_remaining_coverage_capped_at_horizon() {
        let config = EngineConfig::default();
        let oracle = make_oracle(&[("S1", 45.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);
        let remaining = selector
            .remaining_coverage(&make_terminal(AccessPolicy::Consistent), "S1", make_time())
            .unwrap();
        assert_eq!(remaining, config.consistent.horizon());
    }

    #[test]
    fn test_oracle_failure_propagates() {
        let config = EngineConfig::default();
        let oracle = make_oracle(&[("S1", 45.0)]);
        let selector = Selector::new(&config, GuardedOracle::new(&oracle, Deadline::none()), None);
        let ghost = make_state("S404", [1.0, 0.0, 0.0]);
        let err = selector
            .select(&make_terminal(AccessPolicy::Flexible), None, &[&ghost], make_time())
            .unwrap_err();
        assert!(matches!(err, HandoverError::OracleUnavailable { .. }));
    }
}
