//! Measurement-event detection
//!
//! Turns the published mapping table plus externally supplied signal samples
//! into threshold-triggered handover events for the signaling layer.
//!
//! | Kind | Condition (Mn: neighbor, Ms: serving)            |
//! |------|--------------------------------------------------|
//! | A3   | Mn + Ofn - Hys > Ms + Off                        |
//! | A4   | Mn + Ofn - Hys > Thresh                          |
//! | A5   | Ms + Hys < Thresh1 and Mn + Ofn - Hys > Thresh2  |
//! | D2   | Dn + Hys < Ds - Offset                           |
//!
//! Every condition must hold continuously for the time-to-trigger before an
//! event is emitted. An emitted condition fires again only after it clears.

use crate::config::MeasurementConfig;
use crate::mapping::{MappingEntry, MappingTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// Neighbor becomes offset better than serving
    A3,
    /// Neighbor exceeds an absolute threshold
    A4,
    /// Serving degrades below one threshold while a neighbor exceeds another
    A5,
    /// Neighbor closer than serving by more than an offset
    D2,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::A3 => "A3",
            EventKind::A4 => "A4",
            EventKind::A5 => "A5",
            EventKind::D2 => "D2",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoverEvent {
    pub id: Uuid,
    pub terminal_id: String,
    pub source: String,
    pub target: String,
    pub triggered_at: DateTime<Utc>,
    pub kind: EventKind,
    /// Predicted handover instant when `target` is the table's next satellite
    pub scheduled_handover_at: Option<DateTime<Utc>>,
}

/// One terminal's measurement of one satellite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    pub terminal_id: String,
    pub satellite_id: String,
    pub rsrp_dbm: f64,
    pub ground_distance_km: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectorOutput {
    pub events: Vec<HandoverEvent>,
    /// Terminals with no predicted next satellite
    pub outage_risk: Vec<String>,
}

type PendingKey = (String, EventKind, String);

#[derive(Debug, Clone, Copy)]
struct Pending {
    since: DateTime<Utc>,
    fired: bool,
}

pub struct EventDetector {
    config: MeasurementConfig,
    pending: HashMap<PendingKey, Pending>,
}

impl EventDetector {
    pub fn new(config: MeasurementConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.config
    }

    /// Conditions currently being debounced or latched
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Evaluate one batch of samples taken at `now`.
    ///
    /// A condition that is not observed to hold in this batch (including
    /// one whose samples are missing) resets its time-to-trigger timer.
    pub fn evaluate(
        &mut self,
        table: &MappingTable,
        samples: &[SignalSample],
        now: DateTime<Utc>,
    ) -> DetectorOutput {
        let mut by_terminal: BTreeMap<&str, Vec<&SignalSample>> = BTreeMap::new();
        for sample in samples {
            by_terminal
                .entry(sample.terminal_id.as_str())
                .or_default()
                .push(sample);
        }

        let mut holding: HashSet<PendingKey> = HashSet::new();
        let mut events = Vec::new();

        for (terminal_id, terminal_samples) in by_terminal {
            let Some(entry) = table.get(terminal_id) else {
                continue;
            };
            let Some(serving_id) = entry.current_satellite.as_deref() else {
                continue;
            };
            let serving = terminal_samples
                .iter()
                .find(|s| s.satellite_id == serving_id)
                .copied();

            let mut neighbors: Vec<&SignalSample> = terminal_samples
                .iter()
                .filter(|s| s.satellite_id != serving_id)
                .copied()
                .collect();
            neighbors.sort_by(|a, b| a.satellite_id.cmp(&b.satellite_id));

            for neighbor in neighbors {
                for kind in self.triggered(serving, neighbor) {
                    let key = (terminal_id.to_string(), kind, neighbor.satellite_id.clone());
                    holding.insert(key.clone());
                    if let Some(event) = self.debounce(key, entry, serving_id, now) {
                        events.push(event);
                    }
                }
            }
        }

        self.pending.retain(|key, _| holding.contains(key));

        let outage_risk: Vec<String> = table
            .entries()
            .filter(|e| e.outage || e.next_satellite.is_none())
            .map(|e| e.terminal_id.clone())
            .collect();

        if !events.is_empty() || !outage_risk.is_empty() {
            debug!(
                "Detector at {}: {} events, {} outage risks",
                now,
                events.len(),
                outage_risk.len()
            );
        }

        DetectorOutput {
            events,
            outage_risk,
        }
    }

    fn triggered(&self, serving: Option<&SignalSample>, neighbor: &SignalSample) -> Vec<EventKind> {
        let c = &self.config;
        let mn = neighbor.rsrp_dbm + c.offset_db - c.hysteresis_db;
        let mut kinds = Vec::new();

        if let Some(s) = serving {
            if c.a3_enabled && mn > s.rsrp_dbm + c.a3_offset_db {
                kinds.push(EventKind::A3);
            }
        }
        if mn > c.a4_threshold_dbm {
            kinds.push(EventKind::A4);
        }
        if let Some(s) = serving {
            if s.rsrp_dbm + c.hysteresis_db < c.a5_threshold1_dbm && mn > c.a5_threshold2_dbm {
                kinds.push(EventKind::A5);
            }
            if let (Some(dn), Some(ds)) = (neighbor.ground_distance_km, s.ground_distance_km) {
                if dn + c.d2_hysteresis_km < ds - c.d2_offset_km {
                    kinds.push(EventKind::D2);
                }
            }
        }
        kinds
    }

    fn debounce(
        &mut self,
        key: PendingKey,
        entry: &MappingEntry,
        serving_id: &str,
        now: DateTime<Utc>,
    ) -> Option<HandoverEvent> {
        let ttt = self.config.time_to_trigger();
        let pending = self.pending.entry(key.clone()).or_insert(Pending {
            since: now,
            fired: false,
        });
        if pending.fired || now - pending.since < ttt {
            return None;
        }
        pending.fired = true;

        let (terminal_id, kind, target) = key;
        let scheduled_handover_at = entry
            .handover_at
            .filter(|_| entry.handover_pending() && entry.next_satellite.as_deref() == Some(target.as_str()));
        info!("{} event for {}: {} -> {}", kind, terminal_id, serving_id, target);

        Some(HandoverEvent {
            id: Uuid::new_v4(),
            terminal_id,
            source: serving_id.to_string(),
            target,
            triggered_at: now,
            kind,
            scheduled_handover_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccessPolicy;
    use chrono::{Duration, TimeZone};

    fn make_time(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn make_table() -> MappingTable {
        let mut table = MappingTable::new();
        let mut entry = MappingEntry::new("U1", AccessPolicy::Flexible, Some("S1".to_string()), make_time(0));
        entry.next_satellite = Some("S2".to_string());
        entry.handover_at = Some(make_time(400));
        table.insert(entry);
        table
    }

    fn make_sample(sat: &str, rsrp: f64, distance: Option<f64>) -> SignalSample {
        SignalSample {
            terminal_id: "U1".to_string(),
            satellite_id: sat.to_string(),
            rsrp_dbm: rsrp,
            ground_distance_km: distance,
        }
    }

    fn kinds(out: &DetectorOutput) -> Vec<EventKind> {
        out.events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_a4_waits_for_time_to_trigger() {
        let mut detector = EventDetector::new(MeasurementConfig {
            a3_enabled: false,
            ..Default::default()
        });
        let table = make_table();
        // -95 - 2 = -97 > -100
        let samples = vec![make_sample("S1", -99.0, None), make_sample("S2", -95.0, None)];

        assert!(detector.evaluate(&table, &samples, make_time(0)).events.is_empty());
        assert!(detector.evaluate(&table, &samples, make_time(100)).events.is_empty());

        let out = detector.evaluate(&table, &samples, make_time(160));
        assert_eq!(kinds(&out), vec![EventKind::A4]);
        let event = &out.events[0];
        assert_eq!(event.source, "S1");
        assert_eq!(event.target, "S2");
        assert_eq!(event.scheduled_handover_at, Some(make_time(400)));

        // latched until the condition clears
        assert!(detector.evaluate(&table, &samples, make_time(400)).events.is_empty());
    }

    #[test]
    fn test_hysteresis_blocks_marginal_neighbor() {
        let mut detector = EventDetector::new(MeasurementConfig {
            time_to_trigger_ms: 0,
            a3_enabled: false,
            ..Default::default()
        });
        let table = make_table();
        // -99 - 2 = -101, not above -100
        let samples = vec![make_sample("S1", -90.0, None), make_sample("S2", -99.0, None)];
        assert!(detector.evaluate(&table, &samples, make_time(0)).events.is_empty());
    }

    #[test]
    fn test_flapping_condition_never_fires() {
        let mut detector = EventDetector::new(MeasurementConfig {
            a3_enabled: false,
            ..Default::default()
        });
        let table = make_table();
        let strong = vec![make_sample("S1", -99.0, None), make_sample("S2", -95.0, None)];
        let weak = vec![make_sample("S1", -99.0, None), make_sample("S2", -105.0, None)];

        for step in 0..10 {
            let samples = if step % 2 == 0 { &strong } else { &weak };
            let out = detector.evaluate(&table, samples, make_time(step * 100));
            assert!(out.events.is_empty(), "fired at step {}", step);
        }
    }

    #[test]
    fn test_rearms_after_clearing() {
        let mut detector = EventDetector::new(MeasurementConfig {
            time_to_trigger_ms: 0,
            a3_enabled: false,
            ..Default::default()
        });
        let table = make_table();
        let strong = vec![make_sample("S1", -99.0, None), make_sample("S2", -95.0, None)];
        let weak = vec![make_sample("S1", -99.0, None), make_sample("S2", -105.0, None)];

        assert_eq!(detector.evaluate(&table, &strong, make_time(0)).events.len(), 1);
        assert_eq!(detector.evaluate(&table, &weak, make_time(100)).events.len(), 0);
        assert_eq!(detector.pending_len(), 0);
        assert_eq!(detector.evaluate(&table, &strong, make_time(200)).events.len(), 1);
    }

    #[test]
    fn test_a5_and_a3() {
        let mut detector = EventDetector::new(MeasurementConfig {
            time_to_trigger_ms: 0,
            ..Default::default()
        });
        let table = make_table();
        // serving -115 + 2 < -110; neighbor -95 - 2 > -100 and > -115 + 3
        let samples = vec![make_sample("S1", -115.0, None), make_sample("S2", -95.0, None)];
        let out = detector.evaluate(&table, &samples, make_time(0));
        assert_eq!(kinds(&out), vec![EventKind::A3, EventKind::A4, EventKind::A5]);
    }

    #[test]
    fn test_d2_distance_event() {
        let mut detector = EventDetector::new(MeasurementConfig {
            time_to_trigger_ms: 0,
            a3_enabled: false,
            ..Default::default()
        });
        let table = make_table();
        // 300 + 50 < 900 - 200
        let samples = vec![
            make_sample("S1", -120.0, Some(900.0)),
            make_sample("S3", -130.0, Some(300.0)),
        ];
        let out = detector.evaluate(&table, &samples, make_time(0));
        assert_eq!(kinds(&out), vec![EventKind::D2]);
        // S3 is not the predicted next satellite
        assert_eq!(out.events[0].scheduled_handover_at, None);
    }

    #[test]
    fn test_outage_risk_reported() {
        let mut detector = EventDetector::new(MeasurementConfig::default());
        let mut table = make_table();
        let mut lost = MappingEntry::new("U2", AccessPolicy::Consistent, Some("S5".to_string()), make_time(0));
        lost.next_satellite = None;
        lost.outage = true;
        table.insert(lost);

        let out = detector.evaluate(&table, &[], make_time(0));
        assert_eq!(out.outage_risk, vec!["U2".to_string()]);
    }

    #[test]
    fn test_unknown_terminal_ignored() {
        let mut detector = EventDetector::new(MeasurementConfig {
            time_to_trigger_ms: 0,
            ..Default::default()
        });
        let mut sample = make_sample("S2", -60.0, None);
        sample.terminal_id = "ghost".to_string();
        let out = detector.evaluate(&make_table(), &[sample], make_time(0));
        assert!(out.events.is_empty());
    }
}
