//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use handover_engine::{AccessPolicy, Mobility, Terminal, TerminalReport};
use orbital_mechanics::{GeodeticPosition, LookAngles, OracleError, OrbitOracle, SatelliteInfo};
use std::collections::BTreeMap;

pub const MIN_ELEVATION_DEG: f64 = 10.0;

pub fn make_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn at_ms(ms: i64) -> DateTime<Utc> {
    make_epoch() + Duration::milliseconds(ms)
}

/// A visibility window `[start, end)` with a triangular elevation profile
/// that is exactly the minimum elevation at both edges.
#[derive(Debug, Clone, Copy)]
pub struct Pass {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub peak_deg: f64,
}

impl Pass {
    fn elevation(&self, t: DateTime<Utc>) -> Option<f64> {
        if t < self.start || t >= self.end {
            return None;
        }
        let half = (self.end - self.start).num_microseconds().unwrap_or(1) as f64 / 2.0;
        let mid = self.start + Duration::microseconds(half as i64);
        let off = (t - mid).num_microseconds().unwrap_or(0).abs() as f64;
        let shape = (1.0 - off / half).max(0.0);
        Some(MIN_ELEVATION_DEG + (self.peak_deg - MIN_ELEVATION_DEG) * shape)
    }
}

#[derive(Debug, Clone)]
struct ScriptedSatellite {
    constellation: String,
    origin: GeodeticPosition,
    /// Sub-point drift in degrees per second (lat, lon)
    drift: (f64, f64),
    passes: Vec<Pass>,
    failing: bool,
}

/// Oracle whose coverage is scripted per satellite instead of propagated.
///
/// Every satellite hovers over (0, 0) so it is a partition candidate for
/// terminals near the origin; whether it covers a terminal is decided only by
/// its passes.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOracle {
    satellites: BTreeMap<String, ScriptedSatellite>,
    slow: Option<std::time::Duration>,
    slow_positions: Option<std::time::Duration>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    fn satellite(&mut self, id: &str) -> &mut ScriptedSatellite {
        self.satellites
            .entry(id.to_string())
            .or_insert_with(|| ScriptedSatellite {
                constellation: "leo".to_string(),
                origin: GeodeticPosition::new(0.0, 0.0, 550.0),
                drift: (0.0, 0.0),
                passes: Vec::new(),
                failing: false,
            })
    }

    /// Add a pass between `start_ms` and `end_ms` after the epoch
    pub fn with_pass(mut self, id: &str, start_ms: i64, end_ms: i64, peak_deg: f64) -> Self {
        self.satellite(id).passes.push(Pass {
            start: at_ms(start_ms),
            end: at_ms(end_ms),
            peak_deg,
        });
        self
    }

    pub fn with_drift(mut self, id: &str, dlat_deg_s: f64, dlon_deg_s: f64) -> Self {
        self.satellite(id).drift = (dlat_deg_s, dlon_deg_s);
        self
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.satellite(id).failing = true;
        self
    }

    /// Every look-angle call blocks for `delay`
    pub fn slow(mut self, delay: std::time::Duration) -> Self {
        self.slow = Some(delay);
        self
    }

    /// Every position call blocks for `delay`; look angles stay fast
    pub fn slow_positions(mut self, delay: std::time::Duration) -> Self {
        self.slow_positions = Some(delay);
        self
    }

    fn lookup(&self, id: &str) -> Result<&ScriptedSatellite, OracleError> {
        let sat = self
            .satellites
            .get(id)
            .ok_or_else(|| OracleError::UnknownSatellite(id.to_string()))?;
        if sat.failing {
            return Err(OracleError::Propagation {
                satellite: id.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(sat)
    }
}

impl OrbitOracle for ScriptedOracle {
    fn catalog(&self) -> Vec<SatelliteInfo> {
        self.satellites
            .iter()
            .map(|(id, s)| SatelliteInfo {
                id: id.clone(),
                constellation: s.constellation.clone(),
            })
            .collect()
    }

    fn position(&self, id: &str, t: DateTime<Utc>) -> Result<GeodeticPosition, OracleError> {
        if let Some(delay) = self.slow_positions {
            std::thread::sleep(delay);
        }
        let sat = self.lookup(id)?;
        let secs = (t - make_epoch()).num_milliseconds() as f64 / 1000.0;
        Ok(GeodeticPosition::new(
            sat.origin.latitude + sat.drift.0 * secs,
            sat.origin.longitude + sat.drift.1 * secs,
            sat.origin.altitude_km,
        ))
    }

    fn look_angles(
        &self,
        _ground: &GeodeticPosition,
        id: &str,
        t: DateTime<Utc>,
    ) -> Result<LookAngles, OracleError> {
        if let Some(delay) = self.slow {
            std::thread::sleep(delay);
        }
        let sat = self.lookup(id)?;
        let elevation_deg = sat
            .passes
            .iter()
            .find_map(|p| p.elevation(t))
            .unwrap_or(-10.0);
        Ok(LookAngles {
            elevation_deg,
            azimuth_deg: 0.0,
            range_km: 550.0 / elevation_deg.to_radians().sin().max(0.1),
        })
    }
}

pub fn make_terminal(id: &str, policy: AccessPolicy, serving: Option<&str>) -> Terminal {
    Terminal {
        id: id.to_string(),
        mobility: Mobility::fixed(GeodeticPosition::ground(0.5, 0.5)),
        serving_satellite: serving.map(str::to_string),
        policy,
        last_report_at: make_epoch(),
    }
}

pub fn make_report(id: &str, policy: AccessPolicy, serving: Option<&str>, at: DateTime<Utc>) -> TerminalReport {
    let report = TerminalReport::fixed(id, GeodeticPosition::ground(0.5, 0.5), policy, at);
    match serving {
        Some(sat) => report.with_serving(sat),
        None => report,
    }
}

pub fn make_terminals(terminals: Vec<Terminal>) -> BTreeMap<String, Terminal> {
    terminals.into_iter().map(|t| (t.id.clone(), t)).collect()
}
