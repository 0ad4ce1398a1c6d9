mod common;

use common::{at_ms, make_epoch, make_report, ScriptedOracle};
use handover_engine::{
    spawn_ticker, AccessPolicy, Clock, Engine, EngineConfig, EngineHandle, EngineState,
    HandoverError, ManualClock,
};
use orbital_mechanics::OrbitOracle;
use std::sync::Arc;
use std::time::Duration;

fn make_oracle() -> ScriptedOracle {
    ScriptedOracle::new()
        .with_pass("S1", -60_000, 300, 60.0)
        .with_pass("S2", -60_000, 60_000, 40.0)
        .with_drift("S1", 0.05, 0.0)
        .with_drift("S2", 0.05, 0.0)
}

fn spawn_engine(oracle: ScriptedOracle) -> EngineHandle {
    let oracle: Arc<dyn OrbitOracle> = Arc::new(oracle);
    Engine::spawn(EngineConfig::default(), oracle, None).unwrap()
}

#[tokio::test]
async fn test_attach_runs_event_update() {
    let engine = spawn_engine(make_oracle());
    let status = engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S1"), at_ms(0)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.current_satellite.as_deref(), Some("S1"));
    assert_eq!(status.next_satellite.as_deref(), Some("S2"));
    assert!(status.countdown_ms.unwrap() >= 300);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.event_updates, 1);
    assert_eq!(stats.terminals, 1);
}

#[tokio::test]
async fn test_cycle_publishes_snapshot() {
    let engine = spawn_engine(make_oracle());
    let mut updates = engine.subscribe();
    engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S1"), at_ms(0)))
        .await
        .unwrap();
    updates.borrow_and_update();

    let summary = engine.run_cycle(at_ms(0)).await.unwrap();
    assert_eq!(summary.terminals, 1);
    assert_eq!(summary.handovers_predicted, 1);

    assert!(updates.has_changed().unwrap());
    let table = engine.snapshot();
    assert_eq!(table.clock(), Some(at_ms(500)));
    let entry = table.get("U1").unwrap();
    assert_eq!(entry.next_satellite.as_deref(), Some("S2"));
    assert_eq!(entry.updated_at, at_ms(0));

    let status = engine.status("U1", at_ms(100)).unwrap();
    assert!(status.countdown_ms.unwrap() >= 200);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.cycles_completed, 1);
    assert_eq!(stats.state, EngineState::Running);
    assert!(stats.mean_refinement_iterations() > 0.0);
}

#[tokio::test]
async fn test_later_event_update_wins_over_cycle() {
    let engine = spawn_engine(make_oracle());
    engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S1"), at_ms(0)))
        .await
        .unwrap();
    // serving satellite changed at 1000ms
    engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S2"), at_ms(1_000)))
        .await
        .unwrap();

    engine.run_cycle(at_ms(500)).await.unwrap();

    let entry = engine.snapshot().get("U1").cloned().unwrap();
    assert_eq!(entry.updated_at, at_ms(1_000));
    assert_eq!(entry.current_satellite.as_deref(), Some("S2"));
    assert_eq!(engine.snapshot().clock(), Some(at_ms(1_000)));
}

#[tokio::test]
async fn test_out_of_order_report_rejected() {
    let engine = spawn_engine(make_oracle());
    engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S1"), at_ms(1_000)))
        .await
        .unwrap();

    let err = engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S2"), at_ms(500)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        HandoverError::OutOfOrderReport {
            terminal: "U1".to_string(),
            reported_at: at_ms(500),
        }
    );
    assert_eq!(engine.stats().await.unwrap().out_of_order_reports, 1);
}

#[tokio::test]
async fn test_small_move_does_not_recompute() {
    let engine = spawn_engine(make_oracle());
    engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S1"), at_ms(0)))
        .await
        .unwrap();
    engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S1"), at_ms(100)))
        .await
        .unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.event_updates, 1);
}

#[tokio::test]
async fn test_newer_tick_supersedes_running_cycle() {
    let oracle = make_oracle().slow(Duration::from_millis(40));
    let engine = spawn_engine(oracle);
    for i in 0..4 {
        let id = format!("U{}", i);
        engine
            .report(make_report(&id, AccessPolicy::Flexible, Some("S2"), at_ms(0)))
            .await
            .unwrap();
    }

    let (first, second) = tokio::join!(engine.run_cycle(at_ms(0)), engine.run_cycle(at_ms(500)));
    assert_eq!(first.unwrap_err(), HandoverError::CycleSuperseded);
    assert!(second.is_ok());

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.cycles_superseded, 1);
    assert_eq!(stats.cycles_completed, 1);
    assert_eq!(engine.snapshot().clock(), Some(at_ms(1_000)));
}

#[tokio::test]
async fn test_detach_removes_entry() {
    let engine = spawn_engine(make_oracle());
    engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S1"), at_ms(0)))
        .await
        .unwrap();
    engine.detach("U1").await.unwrap();

    assert!(engine.snapshot().get("U1").is_none());
    assert_eq!(
        engine.detach("U1").await,
        Err(HandoverError::UnknownTerminal("U1".to_string()))
    );
    assert!(matches!(
        engine.status("U1", at_ms(0)),
        Err(HandoverError::UnknownTerminal(_))
    ));

    let summary = engine.run_cycle(at_ms(500)).await.unwrap();
    assert_eq!(summary.terminals, 0);
}

#[tokio::test]
async fn test_shutdown_stops_engine() {
    let engine = spawn_engine(make_oracle());
    engine.shutdown().await.unwrap();
    assert_eq!(
        engine.run_cycle(at_ms(0)).await.unwrap_err(),
        HandoverError::EngineStopped
    );
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let oracle: Arc<dyn OrbitOracle> = Arc::new(make_oracle());
    let config = EngineConfig {
        delta_t_ms: 0,
        ..Default::default()
    };
    assert!(matches!(
        Engine::spawn(config, oracle, None),
        Err(HandoverError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_ticker_drives_cycles() {
    let engine = spawn_engine(make_oracle());
    engine
        .report(make_report("U1", AccessPolicy::Flexible, Some("S1"), at_ms(0)))
        .await
        .unwrap();

    let clock = ManualClock::new(make_epoch());
    let mut updates = engine.subscribe();
    updates.borrow_and_update();

    let ticker = spawn_ticker(engine.clone(), Arc::new(clock.clone()), Duration::from_millis(20));
    tokio::time::timeout(Duration::from_secs(5), async {
        while updates.borrow().clock().is_none() {
            if updates.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap();
    ticker.abort();

    assert_eq!(engine.snapshot().clock(), Some(clock.now() + chrono::Duration::milliseconds(500)));
}
