//! Link-quality estimation
//!
//! The selector ranks candidates by a scalar score where larger is better.
//! Without an estimator the elevation angle is the score.

use chrono::{DateTime, Utc};
use orbital_mechanics::{GeodeticPosition, OracleError, OrbitOracle};
use std::f64::consts::PI;
use std::sync::Arc;

const SPEED_OF_LIGHT_M_S: f64 = 299_792_458.0;

pub trait LinkQualityEstimator: Send + Sync {
    /// Higher is better. Must be monotonic in link geometry for a fixed satellite altitude.
    fn quality(
        &self,
        ground: &GeodeticPosition,
        satellite_id: &str,
        time: DateTime<Utc>,
    ) -> Result<f64, OracleError>;
}

/// Negated RF path loss: free space over the slant range plus atmospheric
/// absorption scaled by air mass.
pub struct PathLossEstimator {
    oracle: Arc<dyn OrbitOracle>,
    carrier_ghz: f64,
    zenith_absorption_db: f64,
}

impl PathLossEstimator {
    /// Ku-band downlink defaults
    pub fn new(oracle: Arc<dyn OrbitOracle>) -> Self {
        Self::with_carrier(oracle, 12.0, 0.3)
    }

    pub fn with_carrier(oracle: Arc<dyn OrbitOracle>, carrier_ghz: f64, zenith_absorption_db: f64) -> Self {
        Self {
            oracle,
            carrier_ghz,
            zenith_absorption_db,
        }
    }

    /// Total loss in dB for a link at the given geometry
    pub fn path_loss_db(&self, range_km: f64, elevation_deg: f64) -> f64 {
        free_space_path_loss(range_km, self.carrier_ghz)
            + atmospheric_loss(elevation_deg, self.zenith_absorption_db)
    }
}

impl LinkQualityEstimator for PathLossEstimator {
    fn quality(
        &self,
        ground: &GeodeticPosition,
        satellite_id: &str,
        time: DateTime<Utc>,
    ) -> Result<f64, OracleError> {
        let look = self.oracle.look_angles(ground, satellite_id, time)?;
        Ok(-self.path_loss_db(look.range_km, look.elevation_deg))
    }
}

/// Free space path loss in dB
pub fn free_space_path_loss(range_km: f64, carrier_ghz: f64) -> f64 {
    let range_m = range_km.max(1e-3) * 1000.0;
    let wavelength_m = SPEED_OF_LIGHT_M_S / (carrier_ghz * 1e9);

    // FSPL = (4 * pi * d / lambda)^2
    let fspl = (4.0 * PI * range_m / wavelength_m).powi(2);
    10.0 * fspl.log10()
}

/// Atmospheric absorption loss
pub fn atmospheric_loss(elevation_deg: f64, zenith_absorption_db: f64) -> f64 {
    // Air mass approximation (Kasten-Young), valid down to the horizon
    let zenith_deg = 90.0 - elevation_deg.clamp(0.0, 90.0);
    let air_mass =
        1.0 / (zenith_deg.to_radians().cos() + 0.50572 * (96.07995 - zenith_deg).powf(-1.6364));

    zenith_absorption_db * air_mass
}
