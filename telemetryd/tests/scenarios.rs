//! End-to-end scenarios exercising the full path from a worker's script
//! bootstrap through the manager's per-frame drain to the published
//! `UiSnapshot`/`SignalRegistry` state a renderer would read.

use std::time::{Duration, Instant};

use telemetryd::config::Config;
use telemetryd::context::{AppContext, WorkerManager};
use telemetryd::errors::ScriptError;
use telemetryd::ids::WidgetIdRegistry;
use telemetryd::metrics::Metrics;
use telemetryd::runtime::UiRuntime;
use telemetryd::signal::{SignalRegistry, StorageMode};
use telemetryd::snapshot::UiSnapshot;
use telemetryd::worker::{self, SharedState, SpawnConfig};

fn manager() -> WorkerManager {
    let config = Config::default();
    WorkerManager::new(AppContext::new(&config), &config)
}

fn shared_state() -> SharedState {
    SharedState {
        app_running: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)),
        widget_ids: std::sync::Arc::new(WidgetIdRegistry::new()),
        signal_registry: std::sync::Arc::new(SignalRegistry::new(StorageMode::Live, 64)),
        snapshot: std::sync::Arc::new(UiSnapshot::new(2)),
        metrics: std::sync::Arc::new(Metrics::new()),
    }
}

fn spawn_config(id: u32, source: &str) -> SpawnConfig {
    SpawnConfig {
        id,
        bootstrap_source: source.to_string(),
        signal_queue_capacity: 64,
        event_queue_capacity: 16,
        shared_buffer_capacity: 4096,
        idle_sleep: Duration::from_millis(1),
    }
}

/// Scenario 1: a worker parses a 36-byte packet (`"IMU"` header, an f64
/// timestamp at offset 4, an f32 value at offset 12) and, on the next UI
/// frame, the signal registry holds the pushed point.
#[test]
fn scenario_1_basic_signal_flow() {
    let mut mgr = manager();
    let id = mgr
        .spawn_worker(
            r#"
                register_parser("imu", |view| {
                    let t = view.read_double(4, true);
                    let v = view.read_float(12, true);
                    update_signal_fast(get_signal_id("IMU.accelZ"), t, v);
                    true
                });
            "#
            .to_string(),
        )
        .unwrap();

    let mut packet = vec![b'I', b'M', b'U', 0];
    packet.extend_from_slice(&123.5f64.to_le_bytes());
    packet.extend_from_slice(&9.81f32.to_le_bytes());

    let claimed = mgr.worker(id).unwrap().deliver_packet(&packet, 123.5);
    assert_eq!(claimed.as_deref(), Some("imu"));

    mgr.tick(0.016);

    let registry = &mgr.context().signal_registry;
    assert!(registry.exists("IMU.accelZ"));
    let sid = registry.get_or_create_id("IMU.accelZ", None);
    let (t, v) = registry.snapshot_tail(sid).unwrap();
    assert_eq!(t, 123.5);
    assert!((v - 9.81).abs() < 1e-4);

    mgr.shutdown();
}

/// Scenario 2: a `Live` signal of capacity 2 keeps only the most recent
/// two points after a third push evicts the oldest.
#[test]
fn scenario_2_ring_buffer_eviction() {
    let registry = SignalRegistry::new(StorageMode::Live, 2);
    let id = registry.get_or_create_id("s", None);
    registry.append(id, 1.0, 10.0).unwrap();
    registry.append(id, 2.0, 20.0).unwrap();
    registry.append(id, 3.0, 30.0).unwrap();

    assert_eq!(registry.len_of(id), 2);
    assert_eq!(registry.snapshot_window(id, 10), vec![(2.0, 20.0), (3.0, 30.0)]);
}

/// Scenario 3: two parsers register in order `[A, B]`. A rejects every
/// packet; B claims it and emits an update. A's rejection emits nothing.
#[test]
fn scenario_3_parser_chain_ordering() {
    let mut mgr = manager();
    let id = mgr
        .spawn_worker(
            r#"
                register_parser("A", |view| false);
                register_parser("B", |view| {
                    update_signal_fast(get_signal_id("B.value"), 0.0, 42.0);
                    true
                });
            "#
            .to_string(),
        )
        .unwrap();

    let claimed = mgr.worker(id).unwrap().deliver_packet(b"whatever", 0.0);
    assert_eq!(claimed.as_deref(), Some("B"));

    mgr.tick(0.016);
    let registry = &mgr.context().signal_registry;
    assert!(registry.exists("B.value"));
    assert!(!registry.exists("A.value"));

    mgr.shutdown();
}

/// Scenario 4: `on_alert` with a 5-second cooldown, evaluated every
/// 1/60s over 12 simulated seconds, fires at t=0, 5, 10 and nowhere else.
#[test]
fn scenario_4_cooldown_alert_fires_on_schedule() {
    let mut rt = UiRuntime::start(
        r#"
            on_alert("hot", || true, || { set_toggle_state("Alarm", true); }, 5.0);
        "#,
        shared_state(),
        64,
        64,
        256,
        Duration::from_millis(1),
    )
    .unwrap();

    let mut fire_times = Vec::new();
    let frame_dt = 1.0 / 60.0;
    let mut frame = 0u32;
    while (frame as f64 * frame_dt) <= 12.0 {
        let now = frame as f64 * frame_dt;
        rt.tick();
        let fired = rt.run_alerts(now);
        if !fired.is_empty() {
            fire_times.push(now);
        }
        frame += 1;
    }

    assert_eq!(fire_times.len(), 3);
    for (expected, actual) in [0.0, 5.0, 10.0].iter().zip(fire_times.iter()) {
        assert!((expected - actual).abs() <= frame_dt, "expected ~{expected}, got {actual}");
    }
}

/// Scenario 5: a worker's `on_cleanup` (closing a mock socket, modeled
/// here as a signal write) runs, in registration order, before the
/// worker handle reports `Joined` — the same ordering a reload applies
/// between the old script set's cleanups and the new set's bootstrap.
#[test]
fn scenario_5_hot_reload_cleanup_ordering() {
    let shared = shared_state();

    let mut old_worker = worker::spawn_worker(
        spawn_config(
            0,
            r#"
                on_cleanup(|| { update_signal_fast(get_signal_id("socket.closed"), 0.0, 1.0); });
                on_cleanup(|| { update_signal_fast(get_signal_id("socket.closed"), 1.0, 2.0); });
            "#,
        ),
        shared.clone(),
    )
    .unwrap();

    old_worker.request_stop();
    assert!(old_worker.join(Duration::from_secs(1)));

    let mut seen = Vec::new();
    old_worker.signal_queue.drain(10, |u| seen.push(u));
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].time, 0.0);
    assert_eq!(seen[1].time, 1.0);

    // The "new script set" spawns only after the old one's cleanups have
    // already run and drained, matching §4.8's reload ordering.
    let new_worker = worker::spawn_worker(
        spawn_config(1, r#"spawn_task(|| { update_signal_fast(get_signal_id("reloaded"), 0.0, 1.0); });"#),
        shared,
    )
    .unwrap();
    new_worker.request_stop();
}

/// Scenario 6: a worker loops `sleep_seconds(0.01); push_update(...)`.
/// Setting the stop flag makes it exit within the join timeout, and the
/// manager's final drain includes every update pushed before
/// cancellation was observed.
#[test]
fn scenario_6_shutdown_quiescence() {
    let mut mgr = manager();
    mgr.spawn_worker(
        r#"
            spawn_task(|| {
                let i = 0;
                while is_app_running() {
                    update_signal_fast(get_signal_id("heartbeat"), i as float, i as float);
                    i += 1;
                    sleep_seconds(0.01);
                }
            });
        "#
        .to_string(),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));

    let join_timeout = Duration::from_millis(3000);
    let start = Instant::now();
    mgr.shutdown();
    assert!(start.elapsed() <= join_timeout + Duration::from_millis(500));

    assert!(mgr.context().signal_registry.exists("heartbeat"));
}

/// Beyond the six numbered scenarios: the join-timeout-overrun path does
/// not fail the process, only records a metric, per §6/§10.7.
#[test]
fn join_timeout_overrun_is_logged_not_fatal() {
    let config = {
        let mut c = Config::default();
        c.scheduler.join_timeout_ms = 1;
        c
    };
    let mut mgr = WorkerManager::new(AppContext::new(&config), &config);
    mgr.spawn_worker(
        r#"
            spawn_task(|| {
                sleep_seconds(5.0);
            });
        "#
        .to_string(),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    mgr.shutdown();
    assert!(mgr.context().metrics.worker_join_timeouts_total() > 0);
}

/// A worker whose bootstrap script fails to compile is reported to the
/// caller without ever spawning a thread, and does not prevent the
/// manager from starting (§7, §10.7 "graceful partial startup").
#[test]
fn broken_bootstrap_script_does_not_abort_manager_startup() {
    let mut mgr = manager();
    let err = mgr.spawn_worker("not valid rhai (((".to_string()).unwrap_err();
    assert!(matches!(err, ScriptError::BootstrapFailed(_)));
    assert_eq!(mgr.worker_count(), 0);

    mgr.spawn_worker(r#"spawn_task(|| {});"#.to_string()).unwrap();
    assert_eq!(mgr.worker_count(), 1);
    mgr.shutdown();
}
