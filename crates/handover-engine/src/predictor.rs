//! Prediction cycle computation
//!
//! Pure functions over (mapping table, terminals, oracle): the periodic pass
//! over every terminal and the single-terminal event-driven pass. The
//! scheduler actor decides when to run them and publishes their results.

use crate::config::EngineConfig;
use crate::deadline::{Deadline, GuardedOracle};
use crate::mapping::{MappingEntry, MappingTable, RefinementInfo};
use crate::partition::GeoIndex;
use crate::quality::LinkQualityEstimator;
use crate::refiner;
use crate::selector::Selector;
use crate::snapshot::{ConstellationSnapshot, SatelliteState};
use crate::{HandoverError, Result, Terminal};
use chrono::{DateTime, Utc};
use orbital_mechanics::{GeodeticPosition, OrbitOracle};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Constellation state and spatial index at one instant
pub struct Frame {
    pub snapshot: ConstellationSnapshot,
    pub index: GeoIndex,
    pub oracle_failures: usize,
}

impl Frame {
    pub fn candidates(&self, point: &GeodeticPosition) -> Vec<&SatelliteState> {
        self.index
            .candidates(point)
            .into_iter()
            .filter_map(|i| self.snapshot.satellite(i))
            .collect()
    }
}

/// Result of one terminal's computation
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOutcome {
    pub entry: MappingEntry,
    /// Per-terminal failure that shaped the entry, if any
    pub error: Option<HandoverError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub terminals: usize,
    pub handovers_predicted: usize,
    pub refinements: usize,
    pub refinement_iterations: u64,
    pub refinement_fallbacks: usize,
    pub oracle_failures: usize,
    pub no_coverage: usize,
}

impl CycleSummary {
    pub fn absorb(&mut self, outcome: &TerminalOutcome) {
        self.terminals += 1;
        let entry = &outcome.entry;
        if entry.handover_pending() && !entry.stale {
            self.handovers_predicted += 1;
            if let Some(info) = entry.refinement {
                self.refinements += 1;
                self.refinement_iterations += info.iterations as u64;
                if !info.converged {
                    self.refinement_fallbacks += 1;
                }
            }
        }
        match outcome.error {
            Some(HandoverError::OracleUnavailable { .. }) => self.oracle_failures += 1,
            Some(HandoverError::NoCoverage(_)) => self.no_coverage += 1,
            _ => {}
        }
    }
}

pub struct CycleReport {
    /// As-of instant T of the cycle; the table's clock is T + Δt
    pub at: DateTime<Utc>,
    pub table: MappingTable,
    pub summary: CycleSummary,
    pub elapsed: std::time::Duration,
}

struct Prediction {
    next: Option<String>,
    handover_at: Option<DateTime<Utc>>,
    refinement: Option<RefinementInfo>,
    outage: bool,
}

#[derive(Clone)]
pub struct Predictor {
    config: Arc<EngineConfig>,
    oracle: Arc<dyn OrbitOracle>,
    estimator: Option<Arc<dyn LinkQualityEstimator>>,
}

impl Predictor {
    pub fn new(
        config: Arc<EngineConfig>,
        oracle: Arc<dyn OrbitOracle>,
        estimator: Option<Arc<dyn LinkQualityEstimator>>,
    ) -> Self {
        Self {
            config,
            oracle,
            estimator,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn frame(&self, at: DateTime<Utc>) -> Frame {
        let (snapshot, failures) =
            ConstellationSnapshot::capture(self.oracle.as_ref(), at, self.config.direction_sample());
        let index = GeoIndex::build(&snapshot, &self.config);
        Frame {
            snapshot,
            index,
            oracle_failures: failures.len(),
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.config.oracle_timeout())
    }

    fn selector(&self, deadline: Deadline) -> Selector<'_> {
        Selector::new(
            &self.config,
            GuardedOracle::new(self.oracle.as_ref(), deadline),
            self.estimator.as_deref(),
        )
    }

    /// Periodic pass: predict every terminal's assignment at `at + Δt`,
    /// refining the handover instant wherever it changes.
    ///
    /// Returns a complete new table with its clock advanced to `at + Δt`.
    /// Terminals are processed in parallel; a cancelled token abandons the
    /// pass with `CycleSuperseded`.
    pub fn periodic_update(
        &self,
        table: &MappingTable,
        terminals: &BTreeMap<String, Terminal>,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        let started = Instant::now();
        let target = at + self.config.delta_t();
        let frame = self.frame(target);

        let list: Vec<&Terminal> = terminals.values().collect();
        let outcomes: Vec<Option<TerminalOutcome>> = list
            .par_iter()
            .map(|terminal| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(self.cycle_terminal(terminal, table.get(&terminal.id), at, target, &frame))
            })
            .collect();

        if cancel.is_cancelled() {
            debug!("Cycle for {} cancelled", at);
            return Err(HandoverError::CycleSuperseded);
        }

        let mut next = MappingTable::new();
        next.set_clock(target);
        let mut summary = CycleSummary {
            oracle_failures: frame.oracle_failures,
            ..Default::default()
        };
        for outcome in outcomes.into_iter().flatten() {
            summary.absorb(&outcome);
            next.insert(outcome.entry);
        }

        let elapsed = started.elapsed();
        info!(
            "Cycle {} -> {}: {} terminals, {} handovers, {} fallbacks, {} oracle failures, {} outages in {:?}",
            at,
            target,
            summary.terminals,
            summary.handovers_predicted,
            summary.refinement_fallbacks,
            summary.oracle_failures,
            summary.no_coverage,
            elapsed
        );

        Ok(CycleReport {
            at,
            table: next,
            summary,
            elapsed,
        })
    }

    fn cycle_terminal(
        &self,
        terminal: &Terminal,
        previous: Option<&MappingEntry>,
        at: DateTime<Utc>,
        target: DateTime<Utc>,
        frame: &Frame,
    ) -> TerminalOutcome {
        let mut entry = previous.cloned().unwrap_or_else(|| {
            MappingEntry::new(&terminal.id, terminal.policy, terminal.serving_satellite.clone(), at)
        });
        entry.roll_over(at);
        let source = entry.current_satellite.clone();

        match self.predict(terminal, source.as_deref(), at, target, frame, self.deadline()) {
            Ok(p) => Self::fresh(terminal, source, at, p),
            Err(e) => {
                warn!("Terminal {} left stale: {}", terminal.id, e);
                entry.stale = true;
                TerminalOutcome {
                    entry,
                    error: Some(e),
                }
            }
        }
    }

    /// Event-driven pass for a single terminal: assignment now, then the
    /// prediction for `now + Δt` from that assignment.
    pub fn update_terminal(
        &self,
        terminal: &Terminal,
        previous: Option<&MappingEntry>,
        now: DateTime<Utc>,
    ) -> TerminalOutcome {
        let target = now + self.config.delta_t();
        let hint = terminal
            .serving_satellite
            .clone()
            .or_else(|| previous.and_then(|e| e.current_satellite.clone()));

        let stale = |e: HandoverError| {
            warn!("Event update for {} failed: {}", terminal.id, e);
            let mut entry = previous
                .cloned()
                .unwrap_or_else(|| MappingEntry::new(&terminal.id, terminal.policy, hint.clone(), now));
            entry.stale = true;
            TerminalOutcome {
                entry,
                error: Some(e),
            }
        };

        let frame_now = self.frame(now);
        let frame_end = self.frame(target);

        // the terminal's oracle budget starts once the shared frames exist
        let deadline = self.deadline();
        let selector = self.selector(deadline);
        let candidates = frame_now.candidates(&terminal.position_at(now));
        let direction = hint
            .as_deref()
            .and_then(|s| frame_now.snapshot.get(s))
            .and_then(|s| s.direction.as_ref());

        let current = match selector.assign(terminal, hint.as_deref(), direction, &candidates, now) {
            Ok(id) => Some(id),
            Err(HandoverError::NoCoverage(_)) => None,
            Err(e) => return stale(e),
        };

        match self.predict(terminal, current.as_deref(), now, target, &frame_end, deadline) {
            Ok(p) => Self::fresh(terminal, current, now, p),
            Err(e) => stale(e),
        }
    }

    fn fresh(
        terminal: &Terminal,
        current: Option<String>,
        at: DateTime<Utc>,
        p: Prediction,
    ) -> TerminalOutcome {
        let error = p
            .outage
            .then(|| HandoverError::NoCoverage(terminal.id.clone()));
        TerminalOutcome {
            entry: MappingEntry {
                terminal_id: terminal.id.clone(),
                policy: terminal.policy,
                current_satellite: current,
                next_satellite: p.next,
                handover_at: p.handover_at,
                updated_at: at,
                refinement: p.refinement,
                stale: false,
                outage: p.outage,
            },
            error,
        }
    }

    /// Assignment at `end` starting from `source` at `start`, with the
    /// handover instant refined when the two differ.
    fn predict(
        &self,
        terminal: &Terminal,
        source: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        frame: &Frame,
        deadline: Deadline,
    ) -> Result<Prediction> {
        let selector = self.selector(deadline);
        let candidates = frame.candidates(&terminal.position_at(end));
        let direction = source
            .and_then(|s| frame.snapshot.get(s))
            .and_then(|s| s.direction.as_ref());

        let next = match selector.assign(terminal, source, direction, &candidates, end) {
            Ok(id) => id,
            Err(HandoverError::NoCoverage(_)) => {
                debug!("No coverage for {} at {}", terminal.id, end);
                return Ok(Prediction {
                    next: None,
                    handover_at: None,
                    refinement: None,
                    outage: true,
                });
            }
            Err(e) => return Err(e),
        };

        let src = match source {
            Some(src) if src != next => src,
            // unchanged, or acquiring from no service
            _ => {
                return Ok(Prediction {
                    next: Some(next),
                    handover_at: None,
                    refinement: None,
                    outage: false,
                })
            }
        };

        let probe =
            |t: DateTime<Utc>| selector.assign_within_window(terminal, src, direction, &candidates, t);

        let (handover_at, refinement) = match refiner::refine(
            src,
            &next,
            start,
            end,
            self.config.refine_precision(),
            self.config.refine_iteration_margin,
            probe,
        ) {
            Ok(r) => (
                r.handover_at,
                RefinementInfo {
                    iterations: r.iterations,
                    converged: true,
                },
            ),
            Err(HandoverError::RefinementDidNotConverge { iterations }) => {
                warn!(
                    "Refinement {} -> {} for {} did not converge after {} iterations, using {}",
                    src, next, terminal.id, iterations, end
                );
                (
                    end,
                    RefinementInfo {
                        iterations,
                        converged: false,
                    },
                )
            }
            Err(e) => return Err(e),
        };

        debug!(
            "{}: {} -> {} at {} ({} iterations)",
            terminal.id, src, next, handover_at, refinement.iterations
        );

        Ok(Prediction {
            next: Some(next),
            handover_at: Some(handover_at),
            refinement: Some(refinement),
            outage: false,
        })
    }
}
