//! Constellation snapshot at a single instant
//!
//! Positions of every catalog satellite plus an orbital-direction unit vector
//! taken from two closely spaced position samples.

use chrono::{DateTime, Duration, Utc};
use nalgebra::Vector3;
use orbital_mechanics::transforms::geodetic_to_ecef;
use orbital_mechanics::{GeodeticPosition, OracleError, OrbitOracle};
use rayon::prelude::*;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SatelliteState {
    pub id: String,
    pub constellation: String,
    pub position: GeodeticPosition,
    /// Earth-fixed unit vector of travel; `None` if the two samples coincide
    pub direction: Option<Vector3<f64>>,
}

#[derive(Debug, Clone)]
pub struct ConstellationSnapshot {
    pub at: DateTime<Utc>,
    satellites: Vec<SatelliteState>,
    by_id: HashMap<String, usize>,
}

impl ConstellationSnapshot {
    /// Sample the whole catalog at `at` (and `at + sample` for directions).
    ///
    /// Satellites the oracle cannot place are left out and returned alongside
    /// the snapshot so the caller can count them.
    pub fn capture(
        oracle: &dyn OrbitOracle,
        at: DateTime<Utc>,
        sample: Duration,
    ) -> (Self, Vec<(String, OracleError)>) {
        let catalog = oracle.catalog();

        let results: Vec<Result<SatelliteState, (String, OracleError)>> = catalog
            .par_iter()
            .map(|info| {
                let now = oracle
                    .position(&info.id, at)
                    .map_err(|e| (info.id.clone(), e))?;
                let later = oracle
                    .position(&info.id, at + sample)
                    .map_err(|e| (info.id.clone(), e))?;
                Ok(SatelliteState {
                    id: info.id.clone(),
                    constellation: info.constellation.clone(),
                    position: now,
                    direction: direction_between(&now, &later),
                })
            })
            .collect();

        let mut satellites = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for r in results {
            match r {
                Ok(state) => satellites.push(state),
                Err((id, e)) => {
                    warn!("Oracle could not place {} at {}: {}", id, at, e);
                    failures.push((id, e));
                }
            }
        }
        satellites.sort_by(|a, b| a.id.cmp(&b.id));

        debug!(
            "Captured {} satellites at {} ({} failed)",
            satellites.len(),
            at,
            failures.len()
        );

        (Self::from_states(at, satellites), failures)
    }

    pub fn from_states(at: DateTime<Utc>, satellites: Vec<SatelliteState>) -> Self {
        let by_id = satellites
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Self {
            at,
            satellites,
            by_id,
        }
    }

    pub fn get(&self, id: &str) -> Option<&SatelliteState> {
        self.by_id.get(id).map(|&i| &self.satellites[i])
    }

    pub fn satellite(&self, index: usize) -> Option<&SatelliteState> {
        self.satellites.get(index)
    }

    pub fn satellites(&self) -> &[SatelliteState] {
        &self.satellites
    }

    pub fn len(&self) -> usize {
        self.satellites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.satellites.is_empty()
    }
}

/// Unit vector from `a` to `b` in the Earth-fixed frame
pub fn direction_between(a: &GeodeticPosition, b: &GeodeticPosition) -> Option<Vector3<f64>> {
    let (ax, ay, az) = geodetic_to_ecef(a);
    let (bx, by, bz) = geodetic_to_ecef(b);
    Vector3::new(bx - ax, by - ay, bz - az).try_normalize(1e-12)
}

pub fn angle_between_deg(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    a.angle(b).to_degrees()
}
