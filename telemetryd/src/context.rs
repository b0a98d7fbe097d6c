//! Process-wide shared state and the UI-thread frame loop.
//!
//! `AppContext` is the set of process-wide, `Arc`-shared structures every
//! worker and the UI runtime draw from. `WorkerManager` owns the worker
//! handles and the canonical `WidgetState`, and drives the per-frame
//! drain-apply-publish sequence described for the manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::errors::ScriptError;
use crate::handler;
use crate::ids::WidgetIdRegistry;
use crate::metrics::Metrics;
use crate::runtime::UiRuntime;
use crate::signal::{SignalRegistry, StorageMode};
use crate::snapshot::{UiSnapshot, WidgetState};
use crate::worker::{self, SharedState, SpawnConfig, WorkerHandle};

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Process-wide state shared by every worker and the UI runtime.
pub struct AppContext {
    pub app_running: Arc<AtomicBool>,
    pub signal_registry: Arc<SignalRegistry>,
    pub widget_ids: Arc<WidgetIdRegistry>,
    pub snapshot: Arc<UiSnapshot>,
    pub metrics: Arc<Metrics>,
}

impl AppContext {
    pub fn new(config: &Config) -> Self {
        let default_mode = match config.registry.default_mode {
            crate::config::StorageModeConfig::Live => StorageMode::Live,
            crate::config::StorageModeConfig::Offline => StorageMode::Offline,
        };
        Self {
            app_running: Arc::new(AtomicBool::new(true)),
            signal_registry: Arc::new(SignalRegistry::new(default_mode, config.registry.live_capacity)),
            widget_ids: Arc::new(WidgetIdRegistry::new()),
            snapshot: Arc::new(UiSnapshot::new(3)),
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn shared_state(&self) -> SharedState {
        SharedState {
            app_running: self.app_running.clone(),
            widget_ids: self.widget_ids.clone(),
            signal_registry: self.signal_registry.clone(),
            snapshot: self.snapshot.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Owns every worker handle, the UI runtime, and the canonical widget
/// state. Not `Sync`: it is driven from a single UI-thread frame loop.
pub struct WorkerManager {
    ctx: AppContext,
    workers: Vec<WorkerHandle>,
    ui_runtime: Option<UiRuntime>,
    widget_state: WidgetState,
    pending_button_clicks: Mutex<Vec<String>>,
    next_worker_id: u32,
    signal_queue_capacity: usize,
    event_queue_capacity: usize,
    shared_buffer_capacity: usize,
    idle_sleep: Duration,
    join_timeout: Duration,
}

impl WorkerManager {
    pub fn new(ctx: AppContext, config: &Config) -> Self {
        Self {
            ctx,
            workers: Vec::new(),
            ui_runtime: None,
            widget_state: WidgetState::default(),
            pending_button_clicks: Mutex::new(Vec::new()),
            next_worker_id: 0,
            signal_queue_capacity: config.queues.signal_queue_capacity,
            event_queue_capacity: config.queues.event_queue_capacity,
            shared_buffer_capacity: 4096,
            idle_sleep: Duration::from_millis(config.scheduler.idle_sleep_ms),
            join_timeout: Duration::from_millis(config.scheduler.join_timeout_ms),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Compiles and runs `bootstrap_source` on a freshly spawned worker
    /// thread. A bootstrap failure is returned to the caller rather than
    /// panicking, so startup can log it and continue with the remaining
    /// scripts (§7, §10.7 "graceful partial startup").
    pub fn spawn_worker(&mut self, bootstrap_source: String) -> Result<u32, ScriptError> {
        let id = self.next_worker_id;
        let cfg = SpawnConfig {
            id,
            bootstrap_source,
            signal_queue_capacity: self.signal_queue_capacity,
            event_queue_capacity: self.event_queue_capacity,
            shared_buffer_capacity: self.shared_buffer_capacity,
            idle_sleep: self.idle_sleep,
        };
        let handle = worker::spawn_worker(cfg, self.ctx.shared_state())?;
        self.next_worker_id += 1;
        self.workers.push(handle);
        Ok(id)
    }

    pub fn worker(&self, id: u32) -> Option<&WorkerHandle> {
        self.workers.iter().find(|w| w.id == id)
    }

    /// Starts the UI-thread runtime: the same restricted API every worker
    /// gets, plus `on_frame`/`on_alert` and frame introspection.
    pub fn start_ui_runtime(&mut self, bootstrap_source: &str) -> Result<(), ScriptError> {
        let rt = UiRuntime::start(
            bootstrap_source,
            self.ctx.shared_state(),
            self.signal_queue_capacity,
            self.event_queue_capacity,
            self.shared_buffer_capacity,
            self.idle_sleep,
        )?;
        self.ui_runtime = Some(rt);
        Ok(())
    }

    /// Marks `title` clicked for exactly the next frame. Called by the
    /// out-of-scope widget/rendering layer on a real user click.
    pub fn notify_button_clicked(&self, title: &str) {
        self.pending_button_clicks
            .lock()
            .expect("pending button click mutex poisoned")
            .push(title.to_string());
    }

    /// Runs one UI frame (§4.6): drains every worker's queues into the
    /// registry and canonical widget state, publishes the new snapshot,
    /// then runs the UI runtime's frame callbacks and alerts.
    pub fn tick(&mut self, delta_time: f64) {
        handler::reset_button_edges(&mut self.widget_state);
        for title in self.pending_button_clicks.lock().expect("pending button click mutex poisoned").drain(..) {
            self.widget_state.buttons_clicked.insert(title, true);
        }

        self.drain_signal_queues();
        self.drain_event_queues();

        self.ctx.snapshot.publish(self.widget_state.clone());

        if let Some(rt) = &mut self.ui_runtime {
            rt.tick();
            rt.run_frame_callbacks(delta_time);
            let fired = rt.run_alerts(now_seconds());
            for name in fired {
                log::debug!("alert '{name}' fired");
                self.ctx.metrics.record_alert_firing();
            }
        }
    }

    fn drain_signal_queues(&self) {
        for worker in &self.workers {
            worker.signal_queue.drain(usize::MAX, |update| {
                if let Err(err) = self.ctx.signal_registry.append(update.signal_id, update.time, update.value) {
                    log::warn!("worker {}: {err}", worker.id);
                }
            });
        }
        if let Some(rt) = &self.ui_runtime {
            rt.signal_queue().drain(usize::MAX, |update| {
                if let Err(err) = self.ctx.signal_registry.append(update.signal_id, update.time, update.value) {
                    log::warn!("ui runtime: {err}");
                }
            });
        }
        self.ctx
            .metrics
            .set_offline_bytes_estimate(self.ctx.signal_registry.offline_bytes_estimate());
    }

    fn drain_event_queues(&mut self) {
        let widget_ids = &self.ctx.widget_ids;
        let metrics = &self.ctx.metrics;
        let widget_state = &mut self.widget_state;
        for worker in &self.workers {
            worker.event_queue.records.drain(usize::MAX, |record| {
                handler::apply_event(&mut *widget_state, record, widget_ids, &worker.event_queue.payloads, |name| {
                    metrics.warn_once(name)
                });
            });
        }
        if let Some(rt) = &self.ui_runtime {
            rt.event_queue().records.drain(usize::MAX, |record| {
                handler::apply_event(&mut *widget_state, record, widget_ids, &rt.event_queue().payloads, |name| {
                    metrics.warn_once(name)
                });
            });
        }
    }

    /// Sets each worker's stop flag, joins every thread with a bounded
    /// timeout (logging, not failing, on overrun), drains whatever each
    /// worker pushed before it stopped, then shuts down the UI runtime.
    pub fn shutdown(&mut self) {
        self.ctx.app_running.store(false, Ordering::Release);
        for worker in &self.workers {
            worker.request_stop();
        }
        if let Some(rt) = &self.ui_runtime {
            rt.request_stop();
        }

        for worker in &mut self.workers {
            if !worker.join(self.join_timeout) {
                log::warn!("worker {} did not join within {:?}", worker.id, self.join_timeout);
                self.ctx.metrics.record_worker_join_timeout();
            }
        }

        self.drain_signal_queues();
        self.drain_event_queues();
        self.ctx.snapshot.publish(self.widget_state.clone());

        if let Some(mut rt) = self.ui_runtime.take() {
            rt.shutdown();
        }
    }
}
