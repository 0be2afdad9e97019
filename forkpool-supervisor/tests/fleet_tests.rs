mod common;

use common::{FakeLauncher, Script, ms};
use forkpool_core::{
    ChildState, Error, FleetConfig, ReadyOn, SpawnOptions, StatusKind, Strategy,
};
use forkpool_supervisor::Fleet;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;

fn spawn_options(number: usize, strategy: Strategy) -> SpawnOptions {
    SpawnOptions::default()
        .with_number(number)
        .with_strategy(strategy)
        .with_ready_on(ReadyOn::Ready)
        .with_confirm_delay(ms(100))
        .with_disconnect_timeout(ms(300))
}

fn fleet(launcher: &Arc<FakeLauncher>) -> Fleet {
    let config = FleetConfig {
        script: Some("worker.js".to_string()),
        ..FleetConfig::default()
    };
    Fleet::new(launcher.as_launcher(), config).unwrap()
}

fn states(fleet: &Fleet) -> Vec<ChildState> {
    fleet.children().iter().map(|c| c.state()).collect()
}

#[test]
fn test_set_script_validates_and_is_set_once() {
    let launcher = FakeLauncher::new(Script::Silent);
    let fleet = Fleet::new(launcher.as_launcher(), FleetConfig::default()).unwrap();
    assert_eq!(fleet.script(), None);

    assert!(matches!(
        fleet.set_script("  "),
        Err(Error::InvalidArgument(_))
    ));
    fleet.set_script("server.js").unwrap();
    assert_eq!(fleet.script(), Some("server.js"));

    let err = fleet.set_script("other.js").unwrap_err();
    assert!(matches!(err, Error::AlreadyConfigured(_)));
    assert_eq!(err.to_string(), "script has already been configured");
    assert_eq!(fleet.script(), Some("server.js"));
}

#[test]
fn test_script_from_config_counts_as_set() {
    let launcher = FakeLauncher::new(Script::Silent);
    let fleet = fleet(&launcher);
    assert_eq!(fleet.script(), Some("worker.js"));
    assert!(matches!(
        fleet.set_script("again.js"),
        Err(Error::AlreadyConfigured(_))
    ));
}

#[test]
fn test_invalid_defaults_are_rejected() {
    let launcher = FakeLauncher::new(Script::Silent);
    let config = FleetConfig {
        defaults: SpawnOptions::default().with_number(0),
        ..FleetConfig::default()
    };
    assert!(Fleet::new(launcher.as_launcher(), config).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_spawn_without_script_fails_before_forking() {
    let launcher = FakeLauncher::new(Script::ready_in(10));
    let fleet = Fleet::new(launcher.as_launcher(), FleetConfig::default()).unwrap();

    let err = fleet
        .spawn(&spawn_options(2, Strategy::Series))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(fleet.is_empty());
    assert_eq!(launcher.forks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_rejects_zero_workers() {
    let launcher = FakeLauncher::new(Script::ready_in(10));
    let fleet = fleet(&launcher);

    assert!(fleet.spawn(&spawn_options(0, Strategy::Series)).await.is_err());
    assert!(fleet.is_empty());
    assert_eq!(launcher.forks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_spawn_starts_all_workers_together() {
    let launcher = FakeLauncher::new(Script::ready_in(100));
    let fleet = fleet(&launcher);

    let started = Instant::now();
    fleet
        .spawn(&spawn_options(3, Strategy::Parallel))
        .await
        .unwrap();

    // One ready delay plus one confirm window, not three.
    assert!(started.elapsed() < ms(400), "took {:?}", started.elapsed());
    assert_eq!(fleet.len(), 3);
    assert_eq!(states(&fleet), vec![ChildState::Initialized; 3]);
    assert_eq!(launcher.forks(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_series_spawn_goes_one_at_a_time() {
    let launcher = FakeLauncher::new(Script::ready_in(100));
    let fleet = fleet(&launcher);

    let started = Instant::now();
    fleet
        .spawn(&spawn_options(3, Strategy::Series))
        .await
        .unwrap();

    assert!(started.elapsed() >= ms(600));
    assert_eq!(states(&fleet), vec![ChildState::Initialized; 3]);
    let entries = launcher.journal.entries();
    let forks: Vec<_> = entries.iter().filter(|e| e.starts_with("fork")).collect();
    assert_eq!(forks, ["fork 1", "fork 2", "fork 3"]);
    assert!(launcher.journal.position("ready 1") < launcher.journal.position("fork 2"));
}

#[tokio::test(start_paused = true)]
async fn test_series_spawn_stops_at_first_failure() {
    let launcher = FakeLauncher::with_scripts(
        vec![Script::ready_in(10), Script::Silent, Script::ready_in(10)],
        Script::ready_in(10),
    );
    let fleet = fleet(&launcher);

    let err = fleet
        .spawn(&spawn_options(3, Strategy::Series).with_timeout(ms(200)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SpawnTimeout { .. }));
    assert_eq!(launcher.forks(), 2);
    assert_eq!(
        states(&fleet),
        vec![ChildState::Initialized, ChildState::TimedOut, ChildState::New]
    );
}

#[tokio::test(start_paused = true)]
async fn test_parallel_spawn_runs_every_child_despite_failure() {
    let launcher = FakeLauncher::with_scripts(
        vec![Script::ready_in(10), Script::Silent, Script::ready_in(10)],
        Script::ready_in(10),
    );
    let fleet = fleet(&launcher);

    let err = fleet
        .spawn(&spawn_options(3, Strategy::Parallel).with_timeout(ms(200)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SpawnTimeout { .. }));
    assert_eq!(launcher.forks(), 3);
    assert_eq!(
        states(&fleet),
        vec![
            ChildState::Initialized,
            ChildState::TimedOut,
            ChildState::Initialized
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_restart_replaces_every_worker() {
    for strategy in [Strategy::Series, Strategy::Parallel] {
        let launcher = FakeLauncher::new(Script::ready_in(10));
        let fleet = fleet(&launcher);
        fleet
            .spawn(&spawn_options(2, Strategy::Parallel))
            .await
            .unwrap();
        let before: HashSet<_> = fleet.children().iter().map(|c| c.worker_id()).collect();

        fleet.restart(strategy).await.unwrap();

        let after: HashSet<_> = fleet.children().iter().map(|c| c.worker_id()).collect();
        assert!(before.is_disjoint(&after), "{strategy}: {before:?} {after:?}");
        assert_eq!(states(&fleet), vec![ChildState::Initialized; 2]);
        assert_eq!(launcher.forks(), 4);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_disconnects_every_child() {
    let launcher = FakeLauncher::new(Script::ready_in(10));
    let fleet = fleet(&launcher);
    fleet
        .spawn(&spawn_options(3, Strategy::Parallel))
        .await
        .unwrap();

    fleet.stop().await;

    assert_eq!(fleet.len(), 3);
    assert_eq!(states(&fleet), vec![ChildState::Stopped; 3]);
    assert!(launcher.workers().iter().all(|w| w.was_disconnected()));
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_stubborn_workers_concurrently() {
    let launcher = FakeLauncher::new(Script::ready_in(10)).stubborn();
    let fleet = fleet(&launcher);
    fleet
        .spawn(&spawn_options(3, Strategy::Parallel))
        .await
        .unwrap();

    let started = Instant::now();
    fleet.stop().await;

    assert!(started.elapsed() < ms(600));
    assert!(launcher.workers().iter().all(|w| w.was_killed()));
    assert_eq!(states(&fleet), vec![ChildState::Stopped; 3]);
}

#[tokio::test(start_paused = true)]
async fn test_status_events_are_tagged_with_child() {
    let launcher = FakeLauncher::new(Script::ready_in(10));
    let fleet = fleet(&launcher);
    let mut status = fleet.subscribe_status();
    let mut logs = fleet.subscribe_logs();

    fleet
        .spawn(&spawn_options(2, Strategy::Parallel))
        .await
        .unwrap();

    let mut spawned = HashMap::new();
    while let Ok(event) = status.try_recv() {
        assert_eq!(event.event, StatusKind::Spawn);
        spawned.insert(event.child, event.id);
    }
    let children: HashSet<_> = fleet.children().iter().map(|c| c.id()).collect();
    assert_eq!(spawned.keys().copied().collect::<HashSet<_>>(), children);

    let mut log_children = HashSet::new();
    while let Ok(event) = logs.try_recv() {
        log_children.insert(event.child);
    }
    assert_eq!(log_children, children);
}

#[tokio::test(start_paused = true)]
async fn test_fleets_are_independent() {
    let launcher = FakeLauncher::new(Script::ready_in(10));
    let first = fleet(&launcher);
    let second = fleet(&launcher);
    let mut second_status = second.subscribe_status();

    first
        .spawn(&spawn_options(1, Strategy::Series))
        .await
        .unwrap();
    assert!(second_status.try_recv().is_err());

    second
        .spawn(&spawn_options(1, Strategy::Series))
        .await
        .unwrap();
    first.stop().await;

    assert_eq!(states(&first), vec![ChildState::Stopped]);
    assert_eq!(states(&second), vec![ChildState::Initialized]);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_default_uses_configured_options() {
    let launcher = FakeLauncher::new(Script::ready_in(10));
    let config = FleetConfig {
        script: Some("worker.js".to_string()),
        args: vec!["--port".to_string(), "0".to_string()],
        defaults: spawn_options(2, Strategy::Parallel),
        ..FleetConfig::default()
    };
    let fleet = Fleet::new(launcher.as_launcher(), config).unwrap();

    fleet.spawn_default().await.unwrap();

    assert_eq!(fleet.len(), 2);
    let commands = launcher.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands.iter().all(|c| c.args == ["--port", "0"]));
}

#[tokio::test(start_paused = true)]
async fn test_spawn_adds_to_existing_children() {
    let launcher = FakeLauncher::new(Script::ready_in(10));
    let fleet = fleet(&launcher);

    fleet
        .spawn(&spawn_options(1, Strategy::Series))
        .await
        .unwrap();
    fleet
        .spawn(&spawn_options(2, Strategy::Parallel))
        .await
        .unwrap();

    assert_eq!(fleet.len(), 3);
    assert_eq!(states(&fleet), vec![ChildState::Initialized; 3]);
}
