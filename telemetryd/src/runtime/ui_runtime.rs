//! The UI-thread script runtime.
//!
//! Reuses the exact `ScriptContext`/engine/scheduler machinery a worker
//! uses (§4.5) so `get_signal`, `set_toggle_state`, `register_parser`, and
//! every other restricted binding behave identically here. On top of that
//! it layers the UI-only superset bound by `script::install_ui_bindings`:
//! `on_frame`, `on_alert`, and frame introspection.
//!
//! Unlike a worker it has no dedicated OS thread. The manager drives its
//! scheduler and its frame callbacks/alerts once per UI frame, inline with
//! the drain-apply-publish sequence described in §4.6, so that a
//! long-running `on_frame` body competes for the same frame budget the
//! manager is already accounting for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rhai::{Engine, FnPtr, AST};

use crate::alerts::UiRuntimeContext;
use crate::errors::ScriptError;
use crate::queue::{EventQueue, SignalQueue};
use crate::script;
use crate::worker::scheduler::Scheduler;
use crate::worker::{run_cleanups, ScriptContext, SharedState, UI_RUNTIME_WORKER_ID};

pub struct UiRuntime {
    ctx: Arc<ScriptContext>,
    ui_ctx: Arc<UiRuntimeContext>,
    engine: Arc<Engine>,
    ast: Arc<AST>,
    scheduler: Scheduler,
    stop: Arc<AtomicBool>,
    idle_sleep: Duration,
}

impl UiRuntime {
    /// Compiles and runs `bootstrap_source` (typically a set of
    /// `on_frame`/`on_alert` registrations), failing the way a worker's
    /// bootstrap does: the caller decides whether a broken UI script is
    /// fatal to startup or merely leaves the UI runtime idle.
    pub fn start(
        bootstrap_source: &str,
        shared: SharedState,
        signal_queue_capacity: usize,
        event_queue_capacity: usize,
        shared_buffer_capacity: usize,
        idle_sleep: Duration,
    ) -> Result<Self, ScriptError> {
        let signal_queue = Arc::new(SignalQueue::with_capacity(signal_queue_capacity));
        let event_queue = Arc::new(EventQueue::with_capacity(event_queue_capacity));
        let ctx = Arc::new(ScriptContext::new(
            UI_RUNTIME_WORKER_ID,
            shared,
            signal_queue,
            event_queue,
            shared_buffer_capacity,
        ));
        let ui_ctx = Arc::new(UiRuntimeContext::new());

        let mut engine = script::build_engine(ctx.clone());
        script::install_ui_bindings(&mut engine, ui_ctx.clone());
        let ast = engine
            .compile(bootstrap_source)
            .map_err(|err| ScriptError::BootstrapFailed(err.to_string()))?;
        engine
            .run_ast(&ast)
            .map_err(|err| ScriptError::BootstrapFailed(err.to_string()))?;

        let engine = Arc::new(engine);
        let ast = Arc::new(ast);
        ctx.set_runtime(engine.clone(), ast.clone());

        let stop = Arc::new(AtomicBool::new(false));
        let scheduler = Scheduler::new(idle_sleep, stop.clone());

        Ok(Self { ctx, ui_ctx, engine, ast, scheduler, stop, idle_sleep })
    }

    pub fn signal_queue(&self) -> &Arc<SignalQueue> {
        &self.ctx.signal_queue
    }

    pub fn event_queue(&self) -> &Arc<EventQueue> {
        &self.ctx.event_queue
    }

    /// Adapter seam identical to a worker's, for scripts that parse
    /// packets directly on the UI thread rather than through a worker.
    pub fn deliver_packet(&self, bytes: &[u8], now: f64) -> Option<String> {
        self.ctx.deliver_packet(bytes, now)
    }

    /// Injects any tasks spawned since the last tick and runs every ready
    /// task to its next suspension point. Called once per frame, before
    /// `run_frame_callbacks`.
    pub fn tick(&mut self) {
        let to_spawn: Vec<FnPtr> = {
            let mut pending = self.ctx.pending_spawns.lock().expect("pending spawns mutex poisoned");
            pending.drain(..).collect()
        };
        for f in to_spawn {
            let task_engine = self.engine.clone();
            let task_ast = self.ast.clone();
            self.scheduler.spawn_task(move |handle| {
                script::with_current_suspend(handle, || {
                    f.call::<()>(&task_engine, &task_ast, ()).map_err(|err| ScriptError::Runtime {
                        function: "spawn_task".into(),
                        message: err.to_string(),
                    })
                })
            });
        }
        while self.scheduler.step() {}
    }

    /// Advances the frame counter/delta time and runs every `on_frame`
    /// callback to completion (frame callbacks never suspend, per §5).
    pub fn run_frame_callbacks(&self, delta_time: f64) -> u64 {
        let frame_number = self.ui_ctx.begin_frame(delta_time);
        for f in self.ui_ctx.take_frame_callbacks() {
            if let Err(err) = f.call::<()>(&self.engine, &self.ast, ()) {
                log::warn!("on_frame callback errored: {err}");
            }
            // Re-register so the next frame still invokes it: on_frame is a
            // standing subscription, not a one-shot.
            self.ui_ctx.frame_callbacks.lock().expect("frame callback mutex poisoned").push(f);
        }
        frame_number
    }

    /// Evaluates every `on_alert` condition for this frame and fires the
    /// ones that are due, respecting each alert's cooldown. Returns the
    /// names of alerts that fired, for metrics/logging.
    pub fn run_alerts(&self, now: f64) -> Vec<String> {
        let engine = &self.engine;
        let ast = &self.ast;
        self.ui_ctx.poll_alerts(
            now,
            |cond| {
                cond.call::<bool>(engine, ast, ()).unwrap_or_else(|err| {
                    log::warn!("alert condition errored: {err}");
                    false
                })
            },
            |action| {
                if let Err(err) = action.call::<()>(engine, ast, ()) {
                    log::warn!("alert action errored: {err}");
                }
            },
        )
    }

    pub fn set_plot_count(&self, count: usize) {
        self.ui_ctx.set_plot_count(count);
    }

    /// Signals the UI runtime's own tasks to stop. Does not itself drain
    /// or join anything; the manager still owns the frame loop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Cancels any still-suspended tasks and runs `on_cleanup` callbacks,
    /// in registration order, on a fresh scheduler. Called once by the
    /// manager after the last frame.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
        run_cleanups(&self.ctx, &self.engine, &self.ast, self.idle_sleep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::WidgetIdRegistry;
    use crate::metrics::Metrics;
    use crate::signal::SignalRegistry;
    use crate::snapshot::UiSnapshot;
    use std::sync::atomic::AtomicBool;

    fn shared_state() -> SharedState {
        SharedState {
            app_running: Arc::new(AtomicBool::new(true)),
            widget_ids: Arc::new(WidgetIdRegistry::new()),
            signal_registry: Arc::new(SignalRegistry::new(crate::signal::StorageMode::Live, 64)),
            snapshot: Arc::new(UiSnapshot::new(2)),
            metrics: Arc::new(Metrics::new()),
        }
    }

    #[test]
    fn on_frame_callback_runs_every_tick() {
        let mut rt = UiRuntime::start(
            r#"
                on_frame(|| {
                    update_signal_fast(get_signal_id("frames"), get_frame_number().to_float(), 1.0);
                });
            "#,
            shared_state(),
            64,
            64,
            256,
            Duration::from_millis(1),
        )
        .unwrap();

        rt.tick();
        rt.run_frame_callbacks(0.016);
        rt.tick();
        rt.run_frame_callbacks(0.016);

        let mut drained = Vec::new();
        rt.signal_queue().drain(10, |u| drained.push(u));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].time, 1.0);
        assert_eq!(drained[1].time, 2.0);
    }

    #[test]
    fn alert_fires_once_per_cooldown_window() {
        let mut rt = UiRuntime::start(
            r#"
                on_alert("always", || true, || { set_toggle_state("Alarm", true); }, 5.0);
            "#,
            shared_state(),
            64,
            64,
            256,
            Duration::from_millis(1),
        )
        .unwrap();

        rt.tick();
        let fired_first = rt.run_alerts(0.0);
        assert_eq!(fired_first, vec!["always".to_string()]);

        let fired_again = rt.run_alerts(1.0);
        assert!(fired_again.is_empty());

        let fired_later = rt.run_alerts(5.0);
        assert_eq!(fired_later, vec!["always".to_string()]);

        let mut drained = Vec::new();
        rt.event_queue().records.drain(10, |r| drained.push(r));
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn shutdown_runs_registered_cleanup() {
        let mut rt = UiRuntime::start(
            r#"
                on_cleanup(|| { update_signal_fast(get_signal_id("closed"), 0.0, 1.0); });
            "#,
            shared_state(),
            64,
            64,
            256,
            Duration::from_millis(1),
        )
        .unwrap();

        rt.request_stop();
        rt.shutdown();

        let mut drained = Vec::new();
        rt.signal_queue().drain(10, |u| drained.push(u));
        assert_eq!(drained.len(), 1);
    }
}
