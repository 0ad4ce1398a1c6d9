//! Deadline-guarded oracle access
//!
//! Oracle calls are the only place a terminal's computation can stall. Every
//! call made on behalf of one terminal goes through a [`GuardedOracle`] that
//! fails with `OracleUnavailable` once the terminal's budget is spent.

use crate::{HandoverError, Result};
use chrono::{DateTime, Utc};
use orbital_mechanics::{GeodeticPosition, LookAngles, OrbitOracle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn after(budget: Duration) -> Self {
        Deadline(Instant::now().checked_add(budget))
    }

    pub fn expired(&self) -> bool {
        self.0.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

#[derive(Clone, Copy)]
pub struct GuardedOracle<'a> {
    oracle: &'a dyn OrbitOracle,
    deadline: Deadline,
}

impl<'a> GuardedOracle<'a> {
    pub fn new(oracle: &'a dyn OrbitOracle, deadline: Deadline) -> Self {
        Self { oracle, deadline }
    }

    pub fn inner(&self) -> &'a dyn OrbitOracle {
        self.oracle
    }

    pub fn position(&self, satellite_id: &str, time: DateTime<Utc>) -> Result<GeodeticPosition> {
        self.check(satellite_id)?;
        let position = self.oracle.position(satellite_id, time)?;
        self.check(satellite_id)?;
        Ok(position)
    }

    pub fn look_angles(
        &self,
        ground: &GeodeticPosition,
        satellite_id: &str,
        time: DateTime<Utc>,
    ) -> Result<LookAngles> {
        self.check(satellite_id)?;
        let angles = self.oracle.look_angles(ground, satellite_id, time)?;
        self.check(satellite_id)?;
        Ok(angles)
    }

    fn check(&self, satellite_id: &str) -> Result<()> {
        if self.deadline.expired() {
            return Err(HandoverError::OracleUnavailable {
                satellite: satellite_id.to_string(),
                reason: "oracle deadline exceeded".to_string(),
            });
        }
        Ok(())
    }
}
