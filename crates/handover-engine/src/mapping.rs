//! The terminal → satellite mapping table
//!
//! One [`MappingEntry`] per attached terminal. Tables are published as
//! immutable `Arc` snapshots; only the scheduler builds new ones.

use crate::AccessPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionConfidence {
    High,
    Medium,
    Low,
}

impl PredictionConfidence {
    pub fn score(&self) -> f64 {
        match self {
            PredictionConfidence::High => 0.9,
            PredictionConfidence::Medium => 0.6,
            PredictionConfidence::Low => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementInfo {
    pub iterations: u32,
    /// false when the window end was used as a fallback
    pub converged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub terminal_id: String,
    pub policy: AccessPolicy,
    pub current_satellite: Option<String>,
    /// `None` when no satellite is predicted to cover the terminal
    pub next_satellite: Option<String>,
    /// Set only when `next_satellite` differs from `current_satellite`;
    /// always within `[updated_at, updated_at + Δt]`
    pub handover_at: Option<DateTime<Utc>>,
    /// As-of timestamp of the computation that produced this entry
    pub updated_at: DateTime<Utc>,
    pub refinement: Option<RefinementInfo>,
    /// Last update attempt failed on the oracle; fields are from an earlier cycle
    pub stale: bool,
    /// No satellite covers the terminal at the predicted instant
    pub outage: bool,
}

impl MappingEntry {
    pub fn new(terminal_id: &str, policy: AccessPolicy, current: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            terminal_id: terminal_id.to_string(),
            policy,
            next_satellite: current.clone(),
            current_satellite: current,
            handover_at: None,
            updated_at: at,
            refinement: None,
            stale: false,
            outage: false,
        }
    }

    pub fn handover_pending(&self) -> bool {
        self.handover_at.is_some() && self.next_satellite != self.current_satellite
    }

    /// Adopt the predicted satellite once its handover instant has passed.
    /// A terminal with no serving satellite adopts any prediction immediately.
    pub fn roll_over(&mut self, at: DateTime<Utc>) -> bool {
        let due = match (&self.current_satellite, self.handover_at) {
            (None, _) => self.next_satellite.is_some(),
            (Some(_), Some(h)) => h <= at && self.next_satellite.is_some(),
            (Some(_), None) => false,
        };
        if due {
            self.current_satellite = self.next_satellite.clone();
            self.handover_at = None;
        }
        due
    }

    pub fn confidence(&self) -> PredictionConfidence {
        if self.stale || self.outage {
            return PredictionConfidence::Low;
        }
        match self.refinement {
            Some(RefinementInfo { converged: false, .. }) => PredictionConfidence::Medium,
            _ => PredictionConfidence::High,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> TerminalStatus {
        TerminalStatus {
            terminal_id: self.terminal_id.clone(),
            policy: self.policy,
            current_satellite: self.current_satellite.clone(),
            next_satellite: self.next_satellite.clone(),
            handover_at: self.handover_at,
            countdown_ms: self
                .handover_at
                .filter(|_| self.handover_pending())
                .map(|h| (h - now).num_milliseconds().max(0)),
            confidence: self.confidence(),
            stale: self.stale,
            outage: self.outage,
            updated_at: self.updated_at,
        }
    }
}

/// Per-terminal status view for operators and the signaling layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalStatus {
    pub terminal_id: String,
    pub policy: AccessPolicy,
    pub current_satellite: Option<String>,
    pub next_satellite: Option<String>,
    pub handover_at: Option<DateTime<Utc>>,
    /// Time left until a pending handover, clamped at zero
    pub countdown_ms: Option<i64>,
    pub confidence: PredictionConfidence,
    pub stale: bool,
    pub outage: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MappingTable {
    /// Logical clock: the instant the last periodic cycle predicted for
    clock: Option<DateTime<Utc>>,
    entries: BTreeMap<String, MappingEntry>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> Option<DateTime<Utc>> {
        self.clock
    }

    pub fn get(&self, terminal_id: &str) -> Option<&MappingEntry> {
        self.entries.get(terminal_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose handover instant falls in `[from, until)`
    pub fn handovers_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<&MappingEntry> {
        self.entries
            .values()
            .filter(|e| e.handover_pending())
            .filter(|e| e.handover_at.map(|h| h >= from && h < until).unwrap_or(false))
            .collect()
    }

    pub fn outages(&self) -> Vec<&MappingEntry> {
        self.entries.values().filter(|e| e.outage).collect()
    }

    pub(crate) fn set_clock(&mut self, clock: DateTime<Utc>) {
        self.clock = Some(clock);
    }

    pub(crate) fn insert(&mut self, entry: MappingEntry) {
        self.entries.insert(entry.terminal_id.clone(), entry);
    }

    pub(crate) fn remove(&mut self, terminal_id: &str) -> Option<MappingEntry> {
        self.entries.remove(terminal_id)
    }

    pub(crate) fn retain<F: FnMut(&MappingEntry) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|_, e| keep(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn make_time(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn make_pending(handover_ms: i64) -> MappingEntry {
        let mut e = MappingEntry::new("U1", AccessPolicy::Flexible, Some("S1".to_string()), make_time(0));
        e.next_satellite = Some("S2".to_string());
        e.handover_at = Some(make_time(handover_ms));
        e.refinement = Some(RefinementInfo {
            iterations: 5,
            converged: true,
        });
        e
    }

    #[test]
    fn test_roll_over_after_handover_instant() {
        let mut e = make_pending(300);
        assert!(!e.roll_over(make_time(200)));
        assert_eq!(e.current_satellite.as_deref(), Some("S1"));

        assert!(e.roll_over(make_time(500)));
        assert_eq!(e.current_satellite.as_deref(), Some("S2"));
        assert!(e.handover_at.is_none());
        assert!(!e.handover_pending());
    }

    #[test]
    fn test_roll_over_acquires_when_unserved() {
        let mut e = MappingEntry::new("U1", AccessPolicy::Consistent, None, make_time(0));
        e.next_satellite = Some("S7".to_string());
        assert!(e.roll_over(make_time(0)));
        assert_eq!(e.current_satellite.as_deref(), Some("S7"));
    }

    #[test]
    fn test_confidence_levels() {
        let mut e = make_pending(300);
        assert_eq!(e.confidence(), PredictionConfidence::High);

        e.refinement = Some(RefinementInfo {
            iterations: 8,
            converged: false,
        });
        assert_eq!(e.confidence(), PredictionConfidence::Medium);

        e.stale = true;
        assert_eq!(e.confidence(), PredictionConfidence::Low);
        assert_eq!(e.confidence().score(), 0.3);
    }

    #[test]
    fn test_status_countdown() {
        let e = make_pending(300);
        let status = e.status(make_time(100));
        assert_eq!(status.countdown_ms, Some(200));
        assert_eq!(e.status(make_time(400)).countdown_ms, Some(0));

        let idle = MappingEntry::new("U2", AccessPolicy::Flexible, Some("S1".to_string()), make_time(0));
        assert_eq!(idle.status(make_time(0)).countdown_ms, None);
    }

    #[test]
    fn test_handovers_between() {
        let mut table = MappingTable::new();
        table.insert(make_pending(300));
        let mut other = make_pending(900);
        other.terminal_id = "U2".to_string();
        table.insert(other);

        let due = table.handovers_between(make_time(0), make_time(500));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].terminal_id, "U1");
    }
}
