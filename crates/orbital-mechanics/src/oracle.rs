//! Orbit position oracle
//!
//! Answers "where is satellite X at time t" and "how does it look from this
//! ground point". Two backends: a TLE catalog propagated with SGP4, and an
//! analytic circular-orbit Walker constellation for simulation.

use crate::propagation::CompiledElements;
use crate::transforms::{self, EARTH_RADIUS_KM, EARTH_ROTATION_RAD_S};
use crate::walker::{WalkerDelta, WalkerSlot};
use crate::{GeodeticPosition, LookAngles, Satellite};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("Unknown satellite: {0}")]
    UnknownSatellite(String),
    #[error("Propagation failed for {satellite}: {reason}")]
    Propagation { satellite: String, reason: String },
    #[error("Orbital elements for {satellite} are {age_hours:.1}h from the requested time")]
    StaleElements { satellite: String, age_hours: f64 },
}

/// Catalog entry: what the partitioner needs to know about a satellite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteInfo {
    pub id: String,
    pub constellation: String,
}

pub trait OrbitOracle: Send + Sync {
    /// Satellites currently available for service.
    fn catalog(&self) -> Vec<SatelliteInfo>;

    fn position(
        &self,
        satellite_id: &str,
        time: DateTime<Utc>,
    ) -> Result<GeodeticPosition, OracleError>;

    fn look_angles(
        &self,
        ground: &GeodeticPosition,
        satellite_id: &str,
        time: DateTime<Utc>,
    ) -> Result<LookAngles, OracleError> {
        let position = self.position(satellite_id, time)?;
        Ok(transforms::look_angles(ground, &position))
    }
}

struct CatalogEntry {
    info: SatelliteInfo,
    elements: CompiledElements,
}

/// TLE-backed oracle
pub struct Sgp4Oracle {
    entries: HashMap<String, CatalogEntry>,
    max_element_age: Duration,
}

impl Sgp4Oracle {
    /// Build from a satellite list. Unparseable element sets and satellites
    /// that are not serviceable are left out of the catalog.
    pub fn new(satellites: &[Satellite], max_element_age: Duration) -> Self {
        let mut entries = HashMap::new();
        for sat in satellites {
            if !sat.status.is_serviceable() {
                continue;
            }
            match CompiledElements::from_tle(&sat.tle_line1, &sat.tle_line2) {
                Ok(elements) => {
                    entries.insert(
                        sat.id.clone(),
                        CatalogEntry {
                            info: SatelliteInfo {
                                id: sat.id.clone(),
                                constellation: sat.constellation.clone(),
                            },
                            elements,
                        },
                    );
                }
                Err(e) => warn!("Skipping {}: {}", sat.id, e),
            }
        }
        Self {
            entries,
            max_element_age,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl OrbitOracle for Sgp4Oracle {
    fn catalog(&self) -> Vec<SatelliteInfo> {
        let mut infos: Vec<SatelliteInfo> = self.entries.values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn position(
        &self,
        satellite_id: &str,
        time: DateTime<Utc>,
    ) -> Result<GeodeticPosition, OracleError> {
        let entry = self
            .entries
            .get(satellite_id)
            .ok_or_else(|| OracleError::UnknownSatellite(satellite_id.to_string()))?;

        let age = time.signed_duration_since(entry.elements.epoch);
        if age.abs() > self.max_element_age {
            return Err(OracleError::StaleElements {
                satellite: satellite_id.to_string(),
                age_hours: age.num_seconds() as f64 / 3600.0,
            });
        }

        let state = entry
            .elements
            .propagate(time)
            .map_err(|e| OracleError::Propagation {
                satellite: satellite_id.to_string(),
                reason: e.to_string(),
            })?;

        transforms::eci_to_geodetic(state.position_x, state.position_y, state.position_z, time)
            .map_err(|e| OracleError::Propagation {
                satellite: satellite_id.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Analytic circular-orbit oracle for a Walker Delta constellation.
///
/// Positions are exact for the idealized geometry and cheap to evaluate,
/// which makes this backend suitable for simulation and repeatable tests.
pub struct WalkerOracle {
    constellation: String,
    walker: WalkerDelta,
    epoch: DateTime<Utc>,
    slots: HashMap<String, WalkerSlot>,
}

impl WalkerOracle {
    pub fn new(constellation: &str, walker: WalkerDelta, epoch: DateTime<Utc>) -> Self {
        let slots = walker
            .slots()
            .into_iter()
            .map(|slot| (Self::satellite_id(constellation, &slot), slot))
            .collect();
        Self {
            constellation: constellation.to_string(),
            walker,
            epoch,
            slots,
        }
    }

    pub fn satellite_id(constellation: &str, slot: &WalkerSlot) -> String {
        format!("{}-{:02}{:02}", constellation, slot.plane, slot.slot)
    }

    pub fn walker(&self) -> &WalkerDelta {
        &self.walker
    }
}

impl OrbitOracle for WalkerOracle {
    fn catalog(&self) -> Vec<SatelliteInfo> {
        let mut infos: Vec<SatelliteInfo> = self
            .slots
            .keys()
            .map(|id| SatelliteInfo {
                id: id.clone(),
                constellation: self.constellation.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn position(
        &self,
        satellite_id: &str,
        time: DateTime<Utc>,
    ) -> Result<GeodeticPosition, OracleError> {
        let slot = self
            .slots
            .get(satellite_id)
            .ok_or_else(|| OracleError::UnknownSatellite(satellite_id.to_string()))?;

        let dt = time.signed_duration_since(self.epoch).num_milliseconds() as f64 / 1000.0;
        let mean_motion = 2.0 * std::f64::consts::PI / self.walker.orbital_period_s();

        let u = slot.initial_anomaly_deg.to_radians() + mean_motion * dt;
        let raan = slot.raan_deg.to_radians();
        let inc = self.walker.inclination_deg.to_radians();
        let r = EARTH_RADIUS_KM + self.walker.altitude_km;

        let (sin_u, cos_u) = u.sin_cos();
        let (sin_o, cos_o) = raan.sin_cos();
        let x = r * (cos_o * cos_u - sin_o * sin_u * inc.cos());
        let y = r * (sin_o * cos_u + cos_o * sin_u * inc.cos());
        let z = r * sin_u * inc.sin();

        let theta = transforms::gmst_radians(self.epoch) + EARTH_ROTATION_RAD_S * dt;
        let (ex, ey, ez) = transforms::eci_to_ecef(x, y, z, theta);

        transforms::ecef_to_geodetic(ex, ey, ez).map_err(|e| OracleError::Propagation {
            satellite: satellite_id.to_string(),
            reason: e.to_string(),
        })
    }
}
