//! Worker thread: an isolated script interpreter, its cooperative
//! scheduler, and the restricted native API surface bound to it.
//!
//! Interpreters are never shared across threads. Cross-thread
//! communication happens only through the plain-old-data records pushed
//! onto `SignalQueue`/`EventQueue` and the values read from `UiSnapshot`;
//! there is no reference from a worker back into the manager.

pub mod buffer;
pub mod parser;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rhai::{Engine, FnPtr, AST};

use crate::errors::ScriptError;
use crate::ids::WidgetIdRegistry;
use crate::metrics::Metrics;
use crate::queue::{EventQueue, SignalQueue};
use crate::script;
use crate::signal::SignalRegistry;
use crate::snapshot::UiSnapshot;

use buffer::SharedBuffer;
use parser::{PacketCallbacks, ParserRegistry};
use scheduler::Scheduler;

/// Everything a worker-side native function needs: `script::build_engine`
/// closes every registered function over a clone of this `Arc`.
pub struct ScriptContext {
    pub worker_id: u32,
    pub app_running: Arc<AtomicBool>,
    pub widget_ids: Arc<WidgetIdRegistry>,
    pub signal_registry: Arc<SignalRegistry>,
    pub signal_queue: Arc<SignalQueue>,
    pub event_queue: Arc<EventQueue>,
    pub snapshot: Arc<UiSnapshot>,
    pub metrics: Arc<Metrics>,
    pub buffer: Arc<SharedBuffer>,
    pub parsers: Mutex<ParserRegistry>,
    pub packet_callbacks: Mutex<PacketCallbacks>,
    pub cleanups: Mutex<Vec<FnPtr>>,
    pub pending_spawns: Mutex<Vec<FnPtr>>,
    /// Set once, right after the bootstrap script compiles, so that
    /// `deliver_packet` (invoked by whatever transport adapter is handing
    /// the worker bytes) can run parser/callback closures against the same
    /// interpreter the worker's own tasks run on.
    runtime: OnceLock<(Arc<Engine>, Arc<AST>)>,
}

/// Worker id reserved for the UI-thread runtime, which shares the
/// `ScriptContext`/engine machinery a worker uses but has no dedicated OS
/// thread and is never assigned a real worker id by the manager.
pub const UI_RUNTIME_WORKER_ID: u32 = u32::MAX;

impl ScriptContext {
    pub fn new(
        worker_id: u32,
        shared: SharedState,
        signal_queue: Arc<SignalQueue>,
        event_queue: Arc<EventQueue>,
        shared_buffer_capacity: usize,
    ) -> Self {
        Self {
            worker_id,
            app_running: shared.app_running,
            widget_ids: shared.widget_ids,
            signal_registry: shared.signal_registry,
            signal_queue,
            event_queue,
            snapshot: shared.snapshot,
            metrics: shared.metrics,
            buffer: SharedBuffer::with_capacity(shared_buffer_capacity),
            parsers: Mutex::new(ParserRegistry::new()),
            packet_callbacks: Mutex::new(PacketCallbacks::new()),
            cleanups: Mutex::new(Vec::new()),
            pending_spawns: Mutex::new(Vec::new()),
            runtime: OnceLock::new(),
        }
    }

    /// Records the engine/AST pair built around this context, once the
    /// bootstrap script has compiled and run successfully.
    pub(crate) fn set_runtime(&self, engine: Arc<Engine>, ast: Arc<AST>) {
        let _ = self.runtime.set((engine, ast));
    }

    /// Runs the packet-parsing fast path for one received chunk: fills the
    /// worker's shared buffer, tries each registered parser in order, and
    /// on a claim, runs every packet callback registered for that kind,
    /// pushing a `SignalUpdate` for each value one returns.
    ///
    /// Returns the name of the parser that claimed the packet, or `None`.
    pub fn deliver_packet(&self, bytes: &[u8], now: f64) -> Option<String> {
        let (engine, ast) = self.runtime.get()?;
        let n = self.buffer.fill(bytes);
        let view = self.buffer.view(n);

        let claimed = {
            let parsers = self.parsers.lock().expect("parser registry mutex poisoned");
            if parsers.is_empty() {
                let key = format!("worker-{}-no-parsers", self.worker_id);
                if self.metrics.warn_once(&key) {
                    log::warn!(
                        "worker {}: packet received but no parsers are registered",
                        self.worker_id
                    );
                }
                None
            } else {
                let claimed = parsers.try_parse(engine, ast, view);
                if claimed.is_none() {
                    self.metrics.record_parser_mismatch(self.worker_id);
                }
                claimed
            }
        };

        if let Some(kind) = &claimed {
            let callbacks = self.packet_callbacks.lock().expect("packet callback mutex poisoned");
            for (derived_name, value) in callbacks.trigger(engine, ast, kind, now) {
                let id = self.signal_registry.get_or_create_id(&derived_name, None);
                script::push_signal_update(self, id, now, value);
            }
        }

        claimed
    }
}

/// Shared, process-wide state every worker (and the UI-thread runtime)
/// draws from. Held by the `WorkerManager` and cloned into each worker at
/// spawn time.
#[derive(Clone)]
pub struct SharedState {
    pub app_running: Arc<AtomicBool>,
    pub widget_ids: Arc<WidgetIdRegistry>,
    pub signal_registry: Arc<SignalRegistry>,
    pub snapshot: Arc<UiSnapshot>,
    pub metrics: Arc<Metrics>,
}

/// `Spawning -> Running -> Stopping -> Joined`, per the worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Running,
    Stopping,
    Joined,
}

pub struct SpawnConfig {
    pub id: u32,
    pub bootstrap_source: String,
    pub signal_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub shared_buffer_capacity: usize,
    pub idle_sleep: Duration,
}

/// The manager-side handle to a spawned worker thread: its queues (the
/// manager is their sole consumer), its stop flag, its lifecycle state,
/// and its join handle.
pub struct WorkerHandle {
    pub id: u32,
    pub signal_queue: Arc<SignalQueue>,
    pub event_queue: Arc<EventQueue>,
    ctx: Arc<ScriptContext>,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("worker state mutex poisoned")
    }

    /// Sets this worker's stop flag. The worker observes it at its next
    /// scheduler tick (a suspension point or an idle-sleep poll) and never
    /// by forced preemption.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Test/adapter seam for the packet-parsing fast path: a transport
    /// adapter (socket, serial line, file replay) calls this with each
    /// chunk it receives for this worker.
    pub fn deliver_packet(&self, bytes: &[u8], now: f64) -> Option<String> {
        self.ctx.deliver_packet(bytes, now)
    }

    /// Joins the worker thread, waiting at most `timeout`. Returns `false`
    /// without detaching the thread if the timeout elapses first; the
    /// caller may retry or give up and log a warning.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(join) = &self.join else { return true };
        let deadline = Instant::now() + timeout;
        loop {
            if join.is_finished() {
                if let Some(handle) = self.join.take() {
                    let _ = handle.join();
                }
                *self.state.lock().expect("worker state mutex poisoned") = WorkerState::Joined;
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Spawns a worker thread: builds its isolated engine, compiles and runs
/// its bootstrap script (which typically registers parsers/callbacks and
/// spawns at least one long-running task), and starts its scheduler loop.
///
/// A bootstrap compile/run failure is returned to the caller rather than
/// spawning a thread at all, so the manager can log it and continue with
/// the remaining workers (see `WorkerManager::spawn_worker`).
pub fn spawn_worker(cfg: SpawnConfig, shared: SharedState) -> Result<WorkerHandle, ScriptError> {
    let signal_queue = Arc::new(SignalQueue::with_capacity(cfg.signal_queue_capacity));
    let event_queue = Arc::new(EventQueue::with_capacity(cfg.event_queue_capacity));
    let stop = Arc::new(AtomicBool::new(false));
    let state = Arc::new(Mutex::new(WorkerState::Spawning));

    let ctx = Arc::new(ScriptContext::new(
        cfg.id,
        shared,
        signal_queue.clone(),
        event_queue.clone(),
        cfg.shared_buffer_capacity,
    ));

    let engine = script::build_engine(ctx.clone());
    let ast = engine
        .compile(&cfg.bootstrap_source)
        .map_err(|err| ScriptError::BootstrapFailed(err.to_string()))?;
    engine
        .run_ast(&ast)
        .map_err(|err| ScriptError::BootstrapFailed(err.to_string()))?;

    let engine = Arc::new(engine);
    let ast = Arc::new(ast);
    ctx.set_runtime(engine.clone(), ast.clone());

    let worker_id = cfg.id;
    let idle_sleep = cfg.idle_sleep;
    let run_stop = stop.clone();
    let run_state = state.clone();
    let run_ctx = ctx.clone();
    let join = std::thread::Builder::new()
        .name(format!("telemetryd-worker-{worker_id}"))
        .spawn(move || {
            *run_state.lock().expect("worker state mutex poisoned") = WorkerState::Running;
            run_worker_loop(&run_ctx, &engine, &ast, &run_stop, idle_sleep);
            *run_state.lock().expect("worker state mutex poisoned") = WorkerState::Stopping;
            run_cleanups(&run_ctx, &engine, &ast, idle_sleep);
        })
        .expect("failed to spawn worker thread");

    Ok(WorkerHandle {
        id: worker_id,
        signal_queue,
        event_queue,
        ctx,
        stop,
        state,
        join: Some(join),
    })
}

/// Drives one worker's scheduler until the stop flag is observed: each
/// iteration injects any tasks the script spawned since the last pass,
/// then advances the scheduler by one step.
fn run_worker_loop(ctx: &Arc<ScriptContext>, engine: &Arc<Engine>, ast: &Arc<AST>, stop: &Arc<AtomicBool>, idle_sleep: Duration) {
    let mut scheduler = Scheduler::new(idle_sleep, stop.clone());
    loop {
        let to_spawn: Vec<FnPtr> = {
            let mut pending = ctx.pending_spawns.lock().expect("pending spawns mutex poisoned");
            pending.drain(..).collect()
        };
        for f in to_spawn {
            let task_engine = engine.clone();
            let task_ast = ast.clone();
            scheduler.spawn_task(move |handle| {
                script::with_current_suspend(handle, || {
                    f.call::<()>(&task_engine, &task_ast, ()).map_err(|err| ScriptError::Runtime {
                        function: "spawn_task".into(),
                        message: err.to_string(),
                    })
                })
            });
        }

        if stop.load(Ordering::Acquire) {
            scheduler.shutdown();
            return;
        }
        if scheduler.task_count() == 0 {
            std::thread::sleep(idle_sleep);
            continue;
        }
        if !scheduler.step() {
            std::thread::sleep(idle_sleep);
        }
    }
}

/// Runs every `on_cleanup` callback, in registration order, on a fresh
/// scheduler so a cleanup may still yield (e.g. to close a socket
/// asynchronously). One cleanup erroring does not prevent the rest from
/// running.
pub(crate) fn run_cleanups(ctx: &Arc<ScriptContext>, engine: &Arc<Engine>, ast: &Arc<AST>, idle_sleep: Duration) {
    let cleanups: Vec<FnPtr> = {
        let mut guard = ctx.cleanups.lock().expect("cleanup list mutex poisoned");
        guard.drain(..).collect()
    };
    if cleanups.is_empty() {
        return;
    }
    let mut scheduler = Scheduler::new(idle_sleep, Arc::new(AtomicBool::new(false)));
    for f in cleanups {
        let task_engine = engine.clone();
        let task_ast = ast.clone();
        scheduler.spawn_task(move |handle| {
            script::with_current_suspend(handle, || {
                f.call::<()>(&task_engine, &task_ast, ()).map_err(|err| {
                    log::warn!("on_cleanup callback errored: {err}");
                    ScriptError::Runtime {
                        function: "on_cleanup".into(),
                        message: err.to_string(),
                    }
                })
            })
        });
    }
    while scheduler.task_count() > 0 {
        scheduler.step();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::StorageMode;

    fn shared_state() -> SharedState {
        SharedState {
            app_running: Arc::new(AtomicBool::new(true)),
            widget_ids: Arc::new(WidgetIdRegistry::new()),
            signal_registry: Arc::new(SignalRegistry::new(StorageMode::Live, 2000)),
            snapshot: Arc::new(UiSnapshot::new(3)),
            metrics: Arc::new(Metrics::new()),
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

    #[test]
    fn bootstrap_failure_is_reported_without_spawning_a_thread() {
        let result = spawn_worker(spawn_config(1, "this is not valid rhai {{{"), shared_state());
        assert!(result.is_err());
    }

    #[test]
    fn worker_runs_bootstrap_and_spawned_task_pushes_updates() {
        let source = r#"
            register_parser("imu", |view| {
                let t = view.read_double(4, true);
                let v = view.read_float(12, true);
                update_signal_fast(get_signal_id("IMU.accelZ"), t, v);
                true
            });
        "#;
        let mut handle = spawn_worker(spawn_config(2, source), shared_state()).unwrap();

        let mut packet = vec![b'I', b'M', b'U', 0];
        packet.extend_from_slice(&123.5f64.to_le_bytes());
        packet.extend_from_slice(&9.81f32.to_le_bytes());

        let claimed = handle.deliver_packet(&packet, 123.5);
        assert_eq!(claimed.as_deref(), Some("imu"));

        let mut seen = Vec::new();
        let drained = handle.signal_queue.drain(10, |u| seen.push(u));
        assert_eq!(drained, 1);
        assert_eq!(seen[0].time, 123.5);
        assert!((seen[0].value - 9.81).abs() < 1e-4);

        handle.request_stop();
        assert!(handle.join(Duration::from_secs(1)));
        assert_eq!(handle.state(), WorkerState::Joined);
    }

    #[test]
    fn unclaimed_packet_returns_none_and_counts_a_mismatch() {
        let source = r#"register_parser("always_false", |view| false);"#;
        let mut handle = spawn_worker(spawn_config(3, source), shared_state()).unwrap();
        assert_eq!(handle.deliver_packet(b"???", 0.0), None);
        handle.request_stop();
        assert!(handle.join(Duration::from_secs(1)));
    }

    #[test]
    fn stop_cancels_a_sleeping_loop_task_and_worker_joins() {
        let source = r#"
            spawn_task(|| {
                while is_app_running() {
                    sleep_seconds(0.01);
                }
            });
        "#;
        let mut handle = spawn_worker(spawn_config(4, source), shared_state()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        handle.request_stop();
        assert!(handle.join(Duration::from_secs(1)));
        assert_eq!(handle.state(), WorkerState::Joined);
    }

    #[test]
    fn cleanup_runs_after_stop_in_registration_order() {
        let source = r#"
            on_cleanup(|| { update_signal_fast(get_signal_id("cleanup.order"), 1.0, 1.0); });
            on_cleanup(|| { update_signal_fast(get_signal_id("cleanup.order"), 2.0, 2.0); });
        "#;
        let mut handle = spawn_worker(spawn_config(5, source), shared_state()).unwrap();
        handle.request_stop();
        assert!(handle.join(Duration::from_secs(1)));

        let mut seen = Vec::new();
        handle.signal_queue.drain(10, |u| seen.push(u));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].time, 1.0);
        assert_eq!(seen[1].time, 2.0);
    }
}
