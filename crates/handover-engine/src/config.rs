//! Engine configuration
//!
//! Defaults come from [`EngineConfig::default`]; a JSON file may override any
//! subset of fields, and a handful of `HANDOVER_*` environment variables
//! override the file.

use crate::{HandoverError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Periodic look-ahead interval Δt
    pub delta_t_ms: u64,
    /// Bisection stops once the bracket is narrower than this
    pub refine_precision_ms: u64,
    /// Iterations allowed beyond ceil(log2(window / precision))
    pub refine_iteration_margin: u32,
    pub block_size_km: f64,
    /// Per-constellation block size overrides, keyed by constellation tag
    pub constellation_block_size_km: BTreeMap<String, f64>,
    /// Minimum elevation for a satellite to count as covering a terminal
    pub min_elevation_deg: f64,
    pub direction_tolerance_degrees: f64,
    /// Spacing of the two position samples used for the orbital direction
    pub direction_sample_ms: u64,
    /// Per-terminal oracle budget as a fraction of Δt
    pub oracle_timeout_fraction: f64,
    /// Reports further than this from the predicted position trigger an update
    pub position_jump_km: f64,
    pub consistent: ConsistentPolicyConfig,
    pub measurement: MeasurementConfig,
}

/// Lock-in behaviour for consistent-policy terminals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistentPolicyConfig {
    /// Keep the serving satellite only while it covers for at least this long
    pub lock_in_ms: u64,
    /// How far ahead remaining coverage is probed when ranking candidates
    pub horizon_ms: u64,
    pub probe_step_ms: u64,
}

/// Thresholds for measurement events (RSRP in dBm, distances in km)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    pub a3_enabled: bool,
    pub a3_offset_db: f64,
    pub a4_threshold_dbm: f64,
    pub a5_threshold1_dbm: f64,
    pub a5_threshold2_dbm: f64,
    pub hysteresis_db: f64,
    /// Cell-individual offset applied to the neighbor measurement
    pub offset_db: f64,
    pub d2_offset_km: f64,
    pub d2_hysteresis_km: f64,
    pub time_to_trigger_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delta_t_ms: 500,
            refine_precision_ms: 20,
            refine_iteration_margin: 3,
            block_size_km: 50.0,
            constellation_block_size_km: BTreeMap::new(),
            min_elevation_deg: 10.0,
            direction_tolerance_degrees: 30.0,
            direction_sample_ms: 1000,
            oracle_timeout_fraction: 0.25,
            position_jump_km: 50.0,
            consistent: ConsistentPolicyConfig::default(),
            measurement: MeasurementConfig::default(),
        }
    }
}

impl Default for ConsistentPolicyConfig {
    fn default() -> Self {
        Self {
            lock_in_ms: 30_000,
            horizon_ms: 600_000,
            probe_step_ms: 10_000,
        }
    }
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            a3_enabled: true,
            a3_offset_db: 3.0,
            a4_threshold_dbm: -100.0,
            a5_threshold1_dbm: -110.0,
            a5_threshold2_dbm: -100.0,
            hysteresis_db: 2.0,
            offset_db: 0.0,
            d2_offset_km: 200.0,
            d2_hysteresis_km: 50.0,
            time_to_trigger_ms: 160,
        }
    }
}

impl MeasurementConfig {
    pub fn time_to_trigger(&self) -> Duration {
        Duration::milliseconds(self.time_to_trigger_ms as i64)
    }
}

impl ConsistentPolicyConfig {
    pub fn lock_in(&self) -> Duration {
        Duration::milliseconds(self.lock_in_ms as i64)
    }

    pub fn horizon(&self) -> Duration {
        Duration::milliseconds(self.horizon_ms as i64)
    }

    pub fn probe_step(&self) -> Duration {
        Duration::milliseconds(self.probe_step_ms as i64)
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading engine config from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Apply `HANDOVER_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        fn env<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.parse().ok())
        }

        if let Some(v) = env("HANDOVER_DELTA_T_MS") {
            self.delta_t_ms = v;
        }
        if let Some(v) = env("HANDOVER_REFINE_PRECISION_MS") {
            self.refine_precision_ms = v;
        }
        if let Some(v) = env("HANDOVER_BLOCK_SIZE_KM") {
            self.block_size_km = v;
        }
        if let Some(v) = env("HANDOVER_DIRECTION_TOLERANCE_DEG") {
            self.direction_tolerance_degrees = v;
        }
        if let Some(v) = env("HANDOVER_MIN_ELEVATION_DEG") {
            self.min_elevation_deg = v;
        }
        debug!("Effective config: {:?}", self);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(HandoverError::InvalidConfig(msg));

        if self.delta_t_ms == 0 {
            return fail("delta_t_ms must be positive".to_string());
        }
        if self.refine_precision_ms == 0 || self.refine_precision_ms >= self.delta_t_ms {
            return fail(format!(
                "refine_precision_ms must be in (0, {}), got {}",
                self.delta_t_ms, self.refine_precision_ms
            ));
        }
        if !(self.block_size_km > 0.0) {
            return fail(format!("block_size_km must be positive, got {}", self.block_size_km));
        }
        if let Some((tag, size)) = self
            .constellation_block_size_km
            .iter()
            .find(|(_, size)| !(**size > 0.0))
        {
            return fail(format!("block size for {} must be positive, got {}", tag, size));
        }
        if !(-90.0..90.0).contains(&self.min_elevation_deg) {
            return fail(format!("min_elevation_deg out of range: {}", self.min_elevation_deg));
        }
        if !(0.0..=180.0).contains(&self.direction_tolerance_degrees) {
            return fail(format!(
                "direction_tolerance_degrees out of range: {}",
                self.direction_tolerance_degrees
            ));
        }
        if self.direction_sample_ms == 0 {
            return fail("direction_sample_ms must be positive".to_string());
        }
        if !(self.oracle_timeout_fraction > 0.0 && self.oracle_timeout_fraction <= 1.0) {
            return fail(format!(
                "oracle_timeout_fraction must be in (0, 1], got {}",
                self.oracle_timeout_fraction
            ));
        }
        if self.consistent.probe_step_ms == 0 {
            return fail("consistent.probe_step_ms must be positive".to_string());
        }
        Ok(())
    }

    pub fn delta_t(&self) -> Duration {
        Duration::milliseconds(self.delta_t_ms as i64)
    }

    pub fn refine_precision(&self) -> Duration {
        Duration::milliseconds(self.refine_precision_ms as i64)
    }

    pub fn direction_sample(&self) -> Duration {
        Duration::milliseconds(self.direction_sample_ms as i64)
    }

    /// Wall-clock budget for one terminal's oracle calls in a cycle
    pub fn oracle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(
            self.delta_t_ms as f64 / 1000.0 * self.oracle_timeout_fraction,
        )
    }

    pub fn block_size_for(&self, constellation: &str) -> f64 {
        self.constellation_block_size_km
            .get(constellation)
            .copied()
            .unwrap_or(self.block_size_km)
    }
}
