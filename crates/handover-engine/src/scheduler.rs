//! Scheduler actor
//!
//! A single task owns the terminal registry and the mapping table. Callers
//! talk to it through a cloneable [`EngineHandle`]; table snapshots are
//! published on a `watch` channel so readers never block the writer.
//!
//! ```text
//!  EngineHandle ──mpsc──▶ actor ──spawn_blocking──▶ Predictor (rayon)
//!       ▲                   │  ◀───── completions ─────┘
//!       └──── watch<Arc<MappingTable>> ◀──┘
//! ```

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::mapping::{MappingTable, TerminalStatus};
use crate::predictor::{CycleReport, CycleSummary, Predictor, TerminalOutcome};
use crate::quality::LinkQualityEstimator;
use crate::{HandoverError, Result, Terminal, TerminalReport};
use chrono::{DateTime, Utc};
use orbital_mechanics::OrbitOracle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_COMMAND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Stopped,
    Initializing,
    Running,
    PeriodicUpdate,
    EventUpdate,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub terminals: usize,
    pub cycles_completed: u64,
    pub cycles_superseded: u64,
    pub cycles_failed: u64,
    pub event_updates: u64,
    pub handovers_predicted: u64,
    pub refinements: u64,
    pub refinement_iterations: u64,
    pub refinement_fallbacks: u64,
    pub oracle_failures: u64,
    pub no_coverage: u64,
    pub out_of_order_reports: u64,
    pub last_cycle_ms: Option<u64>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self {
            state: EngineState::Initializing,
            terminals: 0,
            cycles_completed: 0,
            cycles_superseded: 0,
            cycles_failed: 0,
            event_updates: 0,
            handovers_predicted: 0,
            refinements: 0,
            refinement_iterations: 0,
            refinement_fallbacks: 0,
            oracle_failures: 0,
            no_coverage: 0,
            out_of_order_reports: 0,
            last_cycle_ms: None,
            last_cycle_at: None,
        }
    }
}

impl EngineStats {
    pub fn mean_refinement_iterations(&self) -> f64 {
        if self.refinements == 0 {
            0.0
        } else {
            self.refinement_iterations as f64 / self.refinements as f64
        }
    }

    fn record_cycle(&mut self, report: &CycleReport) {
        let summary = &report.summary;
        self.cycles_completed += 1;
        self.handovers_predicted += summary.handovers_predicted as u64;
        self.refinements += summary.refinements as u64;
        self.refinement_iterations += summary.refinement_iterations;
        self.refinement_fallbacks += summary.refinement_fallbacks as u64;
        self.oracle_failures += summary.oracle_failures as u64;
        self.no_coverage += summary.no_coverage as u64;
        self.last_cycle_ms = Some(report.elapsed.as_millis() as u64);
        self.last_cycle_at = Some(report.at);
    }
}

type CycleReply = oneshot::Sender<Result<CycleSummary>>;
type StatusReply = oneshot::Sender<Result<Option<TerminalStatus>>>;

enum Command {
    RunCycle {
        at: DateTime<Utc>,
        reply: Option<CycleReply>,
    },
    Report {
        report: TerminalReport,
        reply: StatusReply,
    },
    Detach {
        terminal_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Completion {
    Cycle {
        generation: u64,
        result: Result<CycleReport>,
    },
    Event {
        terminal_id: String,
        result: Result<TerminalOutcome>,
        reply: StatusReply,
    },
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    waiters: Vec<CycleReply>,
}

pub struct Engine;

impl Engine {
    /// Validate the configuration and start the actor on the current runtime.
    pub fn spawn(
        config: EngineConfig,
        oracle: Arc<dyn OrbitOracle>,
        estimator: Option<Arc<dyn LinkQualityEstimator>>,
    ) -> Result<EngineHandle> {
        config.validate()?;
        info!(
            "Starting handover engine: Δt={}ms, precision={}ms, block={}km",
            config.delta_t_ms, config.refine_precision_ms, config.block_size_km
        );

        let predictor = Predictor::new(Arc::new(config), oracle, estimator);
        let (command_tx, command_rx) = mpsc::channel(DEFAULT_COMMAND_CAPACITY);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (table_tx, table_rx) = watch::channel(Arc::new(MappingTable::new()));

        let actor = Actor {
            predictor,
            terminals: BTreeMap::new(),
            table: Arc::new(MappingTable::new()),
            publisher: table_tx,
            stats: EngineStats::default(),
            generation: 0,
            in_flight: None,
            pending_events: 0,
            commands: command_rx,
            done_tx,
            done_rx,
        };
        tokio::spawn(actor.run());

        Ok(EngineHandle {
            commands: command_tx,
            table: table_rx,
        })
    }
}

#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    table: watch::Receiver<Arc<MappingTable>>,
}

impl EngineHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HandoverError::EngineStopped)
    }

    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T> {
        self.send(command).await?;
        rx.await.map_err(|_| HandoverError::EngineStopped)
    }

    /// Run a periodic cycle as of `at` and wait for it to publish.
    pub async fn run_cycle(&self, at: DateTime<Utc>) -> Result<CycleSummary> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::RunCycle { at, reply: Some(tx) }, rx).await?
    }

    /// Start a periodic cycle without waiting for it.
    pub async fn trigger_cycle(&self, at: DateTime<Utc>) -> Result<()> {
        self.send(Command::RunCycle { at, reply: None }).await
    }

    /// Attach a terminal or apply a mobility report. Returns the terminal's
    /// status once any event-driven update it caused has been merged.
    pub async fn report(&self, report: TerminalReport) -> Result<Option<TerminalStatus>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Report { report, reply: tx }, rx).await?
    }

    pub async fn detach(&self, terminal_id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let command = Command::Detach {
            terminal_id: terminal_id.to_string(),
            reply: tx,
        };
        self.request(command, rx).await?
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Stats { reply: tx }, rx).await
    }

    /// Latest published table
    pub fn snapshot(&self) -> Arc<MappingTable> {
        self.table.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MappingTable>> {
        self.table.clone()
    }

    pub fn status(&self, terminal_id: &str, now: DateTime<Utc>) -> Result<TerminalStatus> {
        self.snapshot()
            .get(terminal_id)
            .map(|e| e.status(now))
            .ok_or_else(|| HandoverError::UnknownTerminal(terminal_id.to_string()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Shutdown { reply: tx }, rx).await
    }
}

/// Drive periodic cycles from `clock` every `period`. Missed ticks are
/// skipped rather than bunched up; a slow cycle is superseded by the next.
pub fn spawn_ticker(
    handle: EngineHandle,
    clock: Arc<dyn Clock>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = handle.trigger_cycle(clock.now()).await {
                debug!("Ticker stopping: {}", e);
                break;
            }
        }
    })
}

struct Actor {
    predictor: Predictor,
    terminals: BTreeMap<String, Terminal>,
    table: Arc<MappingTable>,
    publisher: watch::Sender<Arc<MappingTable>>,
    stats: EngineStats,
    generation: u64,
    in_flight: Option<InFlight>,
    pending_events: usize,
    commands: mpsc::Receiver<Command>,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
}

impl Actor {
    async fn run(mut self) {
        self.stats.state = EngineState::Running;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(done) = self.done_rx.recv() => self.complete(done),
            }
        }
        info!("Handover engine stopped");
    }

    fn stop(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            flight.cancel.cancel();
            for waiter in flight.waiters {
                let _ = waiter.send(Err(HandoverError::EngineStopped));
            }
        }
        self.stats.state = EngineState::Stopped;
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RunCycle { at, reply } => self.start_cycle(at, reply),
            Command::Report { report, reply } => self.apply_report(report, reply),
            Command::Detach { terminal_id, reply } => {
                let _ = reply.send(self.detach(&terminal_id));
            }
            Command::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.terminals = self.terminals.len();
                let _ = reply.send(stats);
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn start_cycle(&mut self, at: DateTime<Utc>, reply: Option<CycleReply>) {
        if let Some(flight) = self.in_flight.take() {
            warn!(
                "Cycle generation {} superseded by tick at {}",
                flight.generation, at
            );
            flight.cancel.cancel();
            self.stats.cycles_superseded += 1;
            for waiter in flight.waiters {
                let _ = waiter.send(Err(HandoverError::CycleSuperseded));
            }
        }

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.in_flight = Some(InFlight {
            generation,
            cancel: cancel.clone(),
            waiters: reply.into_iter().collect(),
        });
        self.stats.state = EngineState::PeriodicUpdate;
        debug!("Cycle generation {} as of {}", generation, at);

        let predictor = self.predictor.clone();
        let table = self.table.clone();
        let terminals = self.terminals.clone();
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                predictor.periodic_update(&table, &terminals, at, &cancel)
            })
            .await
            .unwrap_or_else(|e| Err(HandoverError::Worker(e.to_string())));
            let _ = done.send(Completion::Cycle { generation, result });
        });
    }

    fn apply_report(&mut self, report: TerminalReport, reply: StatusReply) {
        let id = report.terminal_id.clone();
        let reported_at = report.reported_at;

        let needs_update = match self.terminals.get_mut(&id) {
            Some(existing) if reported_at < existing.last_report_at => {
                debug!(
                    "Ignoring report for {} at {} (last applied {})",
                    id, reported_at, existing.last_report_at
                );
                self.stats.out_of_order_reports += 1;
                let _ = reply.send(Err(HandoverError::OutOfOrderReport {
                    terminal: id,
                    reported_at,
                }));
                return;
            }
            Some(existing) => {
                let jump = report.jump_km(existing);
                let serving_changed = report.serving_satellite.is_some()
                    && report.serving_satellite != existing.serving_satellite;
                let policy_changed = report.policy != existing.policy;
                let threshold = self.predictor.config().position_jump_km;
                if jump > threshold {
                    info!("Terminal {} jumped {:.1} km, updating", id, jump);
                }
                *existing = report.into_terminal();
                jump > threshold || serving_changed || policy_changed
            }
            None => {
                info!("Terminal {} attached ({})", id, report.policy);
                self.terminals.insert(id.clone(), report.into_terminal());
                true
            }
        };

        if !needs_update {
            let status = self.table.get(&id).map(|e| e.status(reported_at));
            let _ = reply.send(Ok(status));
            return;
        }

        let Some(terminal) = self.terminals.get(&id).cloned() else {
            let _ = reply.send(Err(HandoverError::UnknownTerminal(id)));
            return;
        };
        let previous = self.table.get(&id).cloned();
        let predictor = self.predictor.clone();
        let done = self.done_tx.clone();
        self.pending_events += 1;
        if self.in_flight.is_none() {
            self.stats.state = EngineState::EventUpdate;
        }

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                predictor.update_terminal(&terminal, previous.as_ref(), reported_at)
            })
            .await
            .map_err(|e| HandoverError::Worker(e.to_string()));
            let _ = done.send(Completion::Event {
                terminal_id: id,
                result,
                reply,
            });
        });
    }

    fn detach(&mut self, terminal_id: &str) -> Result<()> {
        if self.terminals.remove(terminal_id).is_none() {
            return Err(HandoverError::UnknownTerminal(terminal_id.to_string()));
        }
        info!("Terminal {} detached", terminal_id);
        let mut table = (*self.table).clone();
        table.remove(terminal_id);
        self.publish(table);
        Ok(())
    }

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::Cycle { generation, result } => self.complete_cycle(generation, result),
            Completion::Event {
                terminal_id,
                result,
                reply,
            } => {
                self.pending_events = self.pending_events.saturating_sub(1);
                let _ = reply.send(self.complete_event(&terminal_id, result));
            }
        }
        self.settle_state();
    }

    fn complete_cycle(&mut self, generation: u64, result: Result<CycleReport>) {
        let current = self
            .in_flight
            .as_ref()
            .map(|f| f.generation == generation)
            .unwrap_or(false);
        if !current {
            debug!("Dropping result of stale cycle generation {}", generation);
            return;
        }
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        match result {
            Ok(report) => {
                let merged = self.merge_cycle(&report);
                self.publish(merged);
                self.stats.record_cycle(&report);
                for waiter in flight.waiters {
                    let _ = waiter.send(Ok(report.summary.clone()));
                }
            }
            Err(e) => {
                error!("Cycle generation {} failed: {}", generation, e);
                self.stats.cycles_failed += 1;
                self.stats.state = EngineState::Error;
                for waiter in flight.waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    /// Cycle entries replace live ones unless the live entry is newer.
    /// Terminals detached mid-cycle are dropped; ones attached mid-cycle keep
    /// their event-driven entry.
    fn merge_cycle(&self, report: &CycleReport) -> MappingTable {
        let mut merged = report.table.clone();
        merged.retain(|e| self.terminals.contains_key(&e.terminal_id));
        for live in self.table.entries() {
            if !self.terminals.contains_key(&live.terminal_id) {
                continue;
            }
            let newer = match merged.get(&live.terminal_id) {
                Some(computed) => live.updated_at > computed.updated_at,
                None => true,
            };
            if newer {
                merged.insert(live.clone());
            }
        }
        merged
    }

    fn complete_event(
        &mut self,
        terminal_id: &str,
        result: Result<TerminalOutcome>,
    ) -> Result<Option<TerminalStatus>> {
        let outcome = result?;
        if !self.terminals.contains_key(terminal_id) {
            debug!("Dropping event update for detached terminal {}", terminal_id);
            return Ok(None);
        }
        let as_of = outcome.entry.updated_at;
        self.stats.event_updates += 1;
        match &outcome.error {
            Some(HandoverError::OracleUnavailable { .. }) => self.stats.oracle_failures += 1,
            Some(HandoverError::NoCoverage(_)) => self.stats.no_coverage += 1,
            _ => {}
        }

        let superseded = self
            .table
            .get(terminal_id)
            .map(|live| live.updated_at > as_of)
            .unwrap_or(false);
        if superseded {
            debug!("Event update for {} at {} is older than the live entry", terminal_id, as_of);
        } else {
            if outcome.entry.handover_pending() {
                self.stats.handovers_predicted += 1;
            }
            let mut table = (*self.table).clone();
            table.insert(outcome.entry);
            self.publish(table);
        }
        Ok(self.table.get(terminal_id).map(|e| e.status(as_of)))
    }

    fn settle_state(&mut self) {
        if self.stats.state == EngineState::Error && self.in_flight.is_none() {
            return;
        }
        self.stats.state = if self.in_flight.is_some() {
            EngineState::PeriodicUpdate
        } else if self.pending_events > 0 {
            EngineState::EventUpdate
        } else {
            EngineState::Running
        };
    }

    fn publish(&mut self, table: MappingTable) {
        self.table = Arc::new(table);
        self.publisher.send_replace(self.table.clone());
    }
}
