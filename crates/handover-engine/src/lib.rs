//! LEO Handover Prediction Engine
//!
//! Decides, for every attached terminal, which satellite will serve it one
//! look-ahead interval (Δt) from now, when the switch must happen, and which
//! standardized measurement events the signaling layer should see.
//!
//! ```text
//! oracle ──▶ snapshot ──▶ partition ──▶ selector ──▶ refiner ──▶ predictor
//!                                                                   │
//!                    measurement ◀── MappingTable (watch) ◀── scheduler actor
//! ```
//!
//! The scheduler actor is the only writer of the [`MappingTable`]. Readers get
//! immutable `Arc` snapshots.

use chrono::{DateTime, Utc};
use orbital_mechanics::transforms::{haversine_km, normalize_longitude};
use orbital_mechanics::{GeodeticPosition, OracleError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod clock;
pub mod config;
pub mod deadline;
pub mod mapping;
pub mod measurement;
pub mod partition;
pub mod predictor;
pub mod quality;
pub mod refiner;
pub mod scheduler;
pub mod selector;
pub mod snapshot;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConsistentPolicyConfig, EngineConfig, MeasurementConfig};
pub use mapping::{MappingEntry, MappingTable, PredictionConfidence, TerminalStatus};
pub use measurement::{EventDetector, EventKind, HandoverEvent, SignalSample};
pub use predictor::Predictor;
pub use quality::{LinkQualityEstimator, PathLossEstimator};
pub use scheduler::{spawn_ticker, Engine, EngineHandle, EngineState, EngineStats};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandoverError {
    #[error("Orbit oracle unavailable for {satellite}: {reason}")]
    OracleUnavailable { satellite: String, reason: String },
    #[error("No satellite covers terminal {0}")]
    NoCoverage(String),
    #[error("Handover refinement did not converge after {iterations} iterations")]
    RefinementDidNotConverge { iterations: u32 },
    #[error("Invalid access policy: {0:?}")]
    InvalidPolicy(String),
    #[error("Unknown terminal: {0}")]
    UnknownTerminal(String),
    #[error("Report for {terminal} at {reported_at} is older than the last applied report")]
    OutOfOrderReport {
        terminal: String,
        reported_at: DateTime<Utc>,
    },
    #[error("Invalid refinement window: {0}")]
    InvalidWindow(String),
    #[error("Invalid mobility trace: {0}")]
    InvalidTrace(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Periodic cycle superseded by a newer tick")]
    CycleSuperseded,
    #[error("Worker failed: {0}")]
    Worker(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("JSON parse error: {0}")]
    Json(String),
    #[error("Engine stopped")]
    EngineStopped,
}

impl From<OracleError> for HandoverError {
    fn from(e: OracleError) -> Self {
        let satellite = match &e {
            OracleError::UnknownSatellite(id) => id.clone(),
            OracleError::Propagation { satellite, .. } => satellite.clone(),
            OracleError::StaleElements { satellite, .. } => satellite.clone(),
        };
        HandoverError::OracleUnavailable {
            satellite,
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for HandoverError {
    fn from(e: std::io::Error) -> Self {
        HandoverError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for HandoverError {
    fn from(e: serde_json::Error) -> Self {
        HandoverError::Json(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HandoverError>;

/// How eagerly a terminal leaves its serving satellite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AccessPolicy {
    /// Stay on the serving satellite while it still covers the terminal.
    Flexible,
    /// Re-evaluate every cycle and lock in the longest-lived choice.
    Consistent,
}

impl AccessPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPolicy::Flexible => "flexible",
            AccessPolicy::Consistent => "consistent",
        }
    }
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessPolicy {
    type Err = HandoverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flexible" => Ok(AccessPolicy::Flexible),
            "consistent" => Ok(AccessPolicy::Consistent),
            _ => Err(HandoverError::InvalidPolicy(s.to_string())),
        }
    }
}

impl TryFrom<String> for AccessPolicy {
    type Error = HandoverError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AccessPolicy> for String {
    fn from(p: AccessPolicy) -> Self {
        p.as_str().to_string()
    }
}

/// Time-stamped terminal position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub at: DateTime<Utc>,
    pub position: GeodeticPosition,
}

/// Where a terminal is over time: a fixed point or a linearly interpolated trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Waypoint>", into = "Vec<Waypoint>")]
pub struct Mobility {
    waypoints: Vec<Waypoint>,
}

impl Mobility {
    pub fn fixed(position: GeodeticPosition) -> Self {
        Self {
            waypoints: vec![Waypoint {
                at: DateTime::<Utc>::default(),
                position,
            }],
        }
    }

    pub fn trace(mut waypoints: Vec<Waypoint>) -> Result<Self> {
        if waypoints.is_empty() {
            return Err(HandoverError::InvalidTrace("trace has no waypoints".to_string()));
        }
        waypoints.sort_by_key(|w| w.at);
        if waypoints.windows(2).any(|w| w[0].at == w[1].at) {
            return Err(HandoverError::InvalidTrace(
                "duplicate waypoint timestamps".to_string(),
            ));
        }
        Ok(Self { waypoints })
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    /// Position at `t`, clamped to the first/last waypoint outside the trace.
    pub fn position_at(&self, t: DateTime<Utc>) -> GeodeticPosition {
        let idx = self.waypoints.partition_point(|w| w.at <= t);
        if idx == 0 {
            return self.waypoints[0].position;
        }
        if idx == self.waypoints.len() {
            return self.waypoints[idx - 1].position;
        }

        let a = &self.waypoints[idx - 1];
        let b = &self.waypoints[idx];
        let span = (b.at - a.at).num_microseconds().unwrap_or(i64::MAX) as f64;
        let frac = (t - a.at).num_microseconds().unwrap_or(0) as f64 / span;

        // Interpolate longitude along the short way round
        let dlon = normalize_longitude(b.position.longitude - a.position.longitude);
        GeodeticPosition {
            latitude: a.position.latitude + (b.position.latitude - a.position.latitude) * frac,
            longitude: normalize_longitude(a.position.longitude + dlon * frac),
            altitude_km: a.position.altitude_km
                + (b.position.altitude_km - a.position.altitude_km) * frac,
        }
    }
}

impl TryFrom<Vec<Waypoint>> for Mobility {
    type Error = HandoverError;

    fn try_from(waypoints: Vec<Waypoint>) -> Result<Self> {
        Mobility::trace(waypoints)
    }
}

impl From<Mobility> for Vec<Waypoint> {
    fn from(m: Mobility) -> Self {
        m.waypoints
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terminal {
    pub id: String,
    pub mobility: Mobility,
    pub serving_satellite: Option<String>,
    pub policy: AccessPolicy,
    pub last_report_at: DateTime<Utc>,
}

impl Terminal {
    pub fn position_at(&self, t: DateTime<Utc>) -> GeodeticPosition {
        self.mobility.position_at(t)
    }
}

/// Attach or mobility report from the external terminal feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalReport {
    pub terminal_id: String,
    pub mobility: Mobility,
    pub serving_satellite: Option<String>,
    pub policy: AccessPolicy,
    pub reported_at: DateTime<Utc>,
}

impl TerminalReport {
    pub fn fixed(
        terminal_id: &str,
        position: GeodeticPosition,
        policy: AccessPolicy,
        reported_at: DateTime<Utc>,
    ) -> Self {
        Self {
            terminal_id: terminal_id.to_string(),
            mobility: Mobility::fixed(position),
            serving_satellite: None,
            policy,
            reported_at,
        }
    }

    pub fn with_serving(mut self, satellite_id: &str) -> Self {
        self.serving_satellite = Some(satellite_id.to_string());
        self
    }

    /// Distance between where `terminal` was expected to be and where this
    /// report puts it, both evaluated at the report timestamp.
    pub fn jump_km(&self, terminal: &Terminal) -> f64 {
        let expected = terminal.position_at(self.reported_at);
        let reported = self.mobility.position_at(self.reported_at);
        haversine_km(
            expected.latitude,
            expected.longitude,
            reported.latitude,
            reported.longitude,
        )
    }

    pub fn into_terminal(self) -> Terminal {
        Terminal {
            id: self.terminal_id,
            mobility: self.mobility,
            serving_satellite: self.serving_satellite,
            policy: self.policy,
            last_report_at: self.reported_at,
        }
    }
}
