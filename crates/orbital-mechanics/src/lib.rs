//! Orbital Mechanics Library
//!
//! SGP4 propagation, coordinate transforms, look angles and Walker Delta
//! constellation modeling. The [`oracle`] module puts both propagators behind
//! one position / look-angle interface consumed by the handover engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod oracle;

pub use oracle::{OracleError, OrbitOracle, SatelliteInfo, Sgp4Oracle, WalkerOracle};

#[derive(Error, Debug)]
pub enum OrbitalError {
    #[error("Invalid TLE format: {0}")]
    InvalidTle(String),
    #[error("Propagation failed: {0}")]
    PropagationFailed(String),
    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),
}

pub type Result<T> = std::result::Result<T, OrbitalError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Satellite {
    pub id: String,
    pub norad_id: u32,
    pub name: String,
    pub constellation: String,
    pub tle_line1: String,
    pub tle_line2: String,
    pub status: SatelliteStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum SatelliteStatus {
    Operational,
    Spare,
    Maneuvering,
    Degraded,
    Offline,
}

impl SatelliteStatus {
    /// Whether a satellite in this state may serve terminals.
    pub fn is_serviceable(&self) -> bool {
        matches!(self, SatelliteStatus::Operational | SatelliteStatus::Degraded)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateVector {
    pub position_x: f64,
    pub position_y: f64,
    pub position_z: f64,
    pub velocity_x: f64,
    pub velocity_y: f64,
    pub velocity_z: f64,
    pub epoch: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeodeticPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_km: f64,
}

impl GeodeticPosition {
    pub fn new(latitude: f64, longitude: f64, altitude_km: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude_km,
        }
    }

    /// Point on the surface.
    pub fn ground(latitude: f64, longitude: f64) -> Self {
        Self::new(latitude, longitude, 0.0)
    }
}

/// Pointing angles from a ground point to a satellite
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LookAngles {
    pub elevation_deg: f64,
    pub azimuth_deg: f64,
    pub range_km: f64,
}

impl Satellite {
    pub fn propagate(&self, time: DateTime<Utc>) -> Result<StateVector> {
        propagation::sgp4_propagate(&self.tle_line1, &self.tle_line2, time)
    }

    pub fn ground_track(&self, time: DateTime<Utc>) -> Result<GeodeticPosition> {
        let state = self.propagate(time)?;
        transforms::eci_to_geodetic(state.position_x, state.position_y, state.position_z, time)
    }
}

pub mod propagation {
    use super::*;

    /// Parsed element set, ready to propagate.
    pub struct CompiledElements {
        constants: sgp4::Constants,
        pub epoch: DateTime<Utc>,
    }

    impl CompiledElements {
        pub fn from_tle(tle_line1: &str, tle_line2: &str) -> Result<Self> {
            let elements = sgp4::Elements::from_tle(
                None,
                tle_line1.as_bytes(),
                tle_line2.as_bytes(),
            ).map_err(|e| OrbitalError::InvalidTle(format!("{:?}", e)))?;

            let constants = sgp4::Constants::from_elements(&elements)
                .map_err(|e| OrbitalError::PropagationFailed(format!("{:?}", e)))?;

            let epoch = DateTime::<Utc>::from_naive_utc_and_offset(elements.datetime, Utc);

            Ok(Self { constants, epoch })
        }

        pub fn propagate(&self, time: DateTime<Utc>) -> Result<StateVector> {
            // Millisecond resolution: refinement works well below one second
            let minutes_since_epoch =
                time.signed_duration_since(self.epoch).num_milliseconds() as f64 / 60_000.0;

            let prediction = self.constants.propagate(minutes_since_epoch)
                .map_err(|e| OrbitalError::PropagationFailed(format!("{:?}", e)))?;

            Ok(StateVector {
                position_x: prediction.position[0],
                position_y: prediction.position[1],
                position_z: prediction.position[2],
                velocity_x: prediction.velocity[0],
                velocity_y: prediction.velocity[1],
                velocity_z: prediction.velocity[2],
                epoch: time,
            })
        }
    }

    pub fn sgp4_propagate(
        tle_line1: &str,
        tle_line2: &str,
        time: DateTime<Utc>,
    ) -> Result<StateVector> {
        CompiledElements::from_tle(tle_line1, tle_line2)?.propagate(time)
    }
}

pub mod transforms {
    use super::*;
    use std::f64::consts::PI;

    /// Spherical Earth radius used by every conversion in this crate.
    pub const EARTH_RADIUS_KM: f64 = 6378.137;
    pub const EARTH_ROTATION_RAD_S: f64 = 7.292_115_146_706_979e-5;

    /// Greenwich mean sidereal time in radians, normalized to [0, 2π)
    pub fn gmst_radians(time: DateTime<Utc>) -> f64 {
        let unix = time.timestamp_millis() as f64 / 1000.0;
        let jd = unix / 86400.0 + 2440587.5;

        // Julian centuries from J2000.0
        let t = (jd - 2451545.0) / 36525.0;

        let gmst_sec = 67310.54841
            + (876600.0 * 3600.0 + 8640184.812866) * t
            + 0.093104 * t * t
            - 6.2e-6 * t * t * t;

        (gmst_sec / 240.0 * (PI / 180.0)).rem_euclid(2.0 * PI)
    }

    /// Rotate an inertial vector into the Earth-fixed frame.
    pub fn eci_to_ecef(x: f64, y: f64, z: f64, gmst: f64) -> (f64, f64, f64) {
        let (sin_g, cos_g) = gmst.sin_cos();
        (cos_g * x + sin_g * y, -sin_g * x + cos_g * y, z)
    }

    pub fn eci_to_geodetic(x: f64, y: f64, z: f64, time: DateTime<Utc>) -> Result<GeodeticPosition> {
        let (ex, ey, ez) = eci_to_ecef(x, y, z, gmst_radians(time));
        ecef_to_geodetic(ex, ey, ez)
    }

    pub fn ecef_to_geodetic(x: f64, y: f64, z: f64) -> Result<GeodeticPosition> {
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return Err(OrbitalError::InvalidCoordinates(format!(
                "non-finite ECEF vector ({}, {}, {})",
                x, y, z
            )));
        }

        let r = (x * x + y * y).sqrt();
        let longitude = y.atan2(x).to_degrees();
        let latitude = z.atan2(r).to_degrees();
        let altitude_km = (x * x + y * y + z * z).sqrt() - EARTH_RADIUS_KM;

        Ok(GeodeticPosition {
            latitude,
            longitude,
            altitude_km,
        })
    }

    pub fn geodetic_to_ecef(pos: &GeodeticPosition) -> (f64, f64, f64) {
        let lat_rad = pos.latitude.to_radians();
        let lon_rad = pos.longitude.to_radians();
        let r = EARTH_RADIUS_KM + pos.altitude_km;

        (
            r * lat_rad.cos() * lon_rad.cos(),
            r * lat_rad.cos() * lon_rad.sin(),
            r * lat_rad.sin(),
        )
    }

    /// Azimuth/elevation/range from a ground point to a target (ENU frame)
    pub fn look_angles(ground: &GeodeticPosition, target: &GeodeticPosition) -> LookAngles {
        let (gx, gy, gz) = geodetic_to_ecef(ground);
        let (sx, sy, sz) = geodetic_to_ecef(target);

        let dx = sx - gx;
        let dy = sy - gy;
        let dz = sz - gz;
        let range_km = (dx * dx + dy * dy + dz * dz).sqrt();

        let (sin_lat, cos_lat) = ground.latitude.to_radians().sin_cos();
        let (sin_lon, cos_lon) = ground.longitude.to_radians().sin_cos();

        let east = -sin_lon * dx + cos_lon * dy;
        let north = -sin_lat * cos_lon * dx - sin_lat * sin_lon * dy + cos_lat * dz;
        let up = cos_lat * cos_lon * dx + cos_lat * sin_lon * dy + sin_lat * dz;

        // Azimuth from North, clockwise
        let azimuth_deg = east.atan2(north).to_degrees().rem_euclid(360.0);
        let elevation_deg = up.atan2((east * east + north * north).sqrt()).to_degrees();

        LookAngles {
            elevation_deg,
            azimuth_deg,
            range_km,
        }
    }

    /// Great-circle surface distance
    pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
        let dlat = (lat2 - lat1).to_radians();
        let dlon = (lon2 - lon1).to_radians();
        let a = (dlat / 2.0).sin().powi(2)
            + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }

    /// Wrap a longitude into [-180, 180)
    pub fn normalize_longitude(lon: f64) -> f64 {
        (lon + 180.0).rem_euclid(360.0) - 180.0
    }

    /// Surface radius of the region seeing a satellite at or above `min_elevation_deg`
    pub fn footprint_radius_km(altitude_km: f64, min_elevation_deg: f64) -> f64 {
        if altitude_km <= 0.0 {
            return 0.0;
        }
        let el = min_elevation_deg.to_radians();
        let ratio = EARTH_RADIUS_KM / (EARTH_RADIUS_KM + altitude_km);
        let central_angle = (ratio * el.cos()).clamp(-1.0, 1.0).acos() - el;
        central_angle.max(0.0) * EARTH_RADIUS_KM
    }
}

pub mod walker {
    use serde::{Deserialize, Serialize};

    /// Walker Delta pattern i: T/P/F
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct WalkerDelta {
        pub total_satellites: u32,
        pub planes: u32,
        pub phasing: u32,
        pub altitude_km: f64,
        pub inclination_deg: f64,
    }

    /// One orbital slot of a Walker pattern
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct WalkerSlot {
        pub plane: u32,
        pub slot: u32,
        pub raan_deg: f64,
        pub initial_anomaly_deg: f64,
    }

    impl WalkerDelta {
        /// 66/6/1 shell at 550 km, 53°
        pub fn leo_shell() -> Self {
            WalkerDelta {
                total_satellites: 66,
                planes: 6,
                phasing: 1,
                altitude_km: 550.0,
                inclination_deg: 53.0,
            }
        }

        pub fn satellites_per_plane(&self) -> u32 {
            self.total_satellites / self.planes.max(1)
        }

        pub fn plane_spacing_deg(&self) -> f64 {
            360.0 / self.planes.max(1) as f64
        }

        pub fn in_plane_spacing_deg(&self) -> f64 {
            360.0 / self.satellites_per_plane().max(1) as f64
        }

        /// Angular offset between the same slot in adjacent planes
        pub fn phase_offset_deg(&self) -> f64 {
            self.phasing as f64 * 360.0 / self.total_satellites.max(1) as f64
        }

        pub fn orbital_period_s(&self) -> f64 {
            const MU_KM3_S2: f64 = 398_600.4418;
            let a = super::transforms::EARTH_RADIUS_KM + self.altitude_km;
            2.0 * std::f64::consts::PI * (a.powi(3) / MU_KM3_S2).sqrt()
        }

        pub fn slots(&self) -> Vec<WalkerSlot> {
            let per_plane = self.satellites_per_plane();
            (0..self.planes)
                .flat_map(|plane| {
                    (0..per_plane).map(move |slot| WalkerSlot {
                        plane,
                        slot,
                        raan_deg: plane as f64 * self.plane_spacing_deg(),
                        initial_anomaly_deg: (slot as f64 * self.in_plane_spacing_deg()
                            + plane as f64 * self.phase_offset_deg())
                            % 360.0,
                    })
                })
                .collect()
        }
    }
}
