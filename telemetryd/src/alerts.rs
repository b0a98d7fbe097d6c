//! The UI-thread runtime's superset bindings: frame callbacks, cooldown
//! alerts, and frame introspection. Everything here executes on the UI
//! thread, after the registry drain and before rendering (see
//! `runtime::ui_runtime`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rhai::FnPtr;

/// One `on_alert` registration: a condition, an action, and the cooldown
/// discipline described in §4.7 — the action fires at most once per
/// `cooldown_s` regardless of how many frames see the condition true.
struct Alert {
    name: String,
    cond: FnPtr,
    action: FnPtr,
    cooldown_s: f64,
    last_triggered_at: Option<f64>,
}

/// Shared state for the UI-thread runtime's native bindings. Built once
/// when the UI runtime starts; every `on_frame`/`on_alert`/introspection
/// function closes over a clone of this behind an `Arc`.
pub struct UiRuntimeContext {
    pub frame_callbacks: Mutex<Vec<FnPtr>>,
    alerts: Mutex<Vec<Alert>>,
    frame_number: AtomicU64,
    delta_time_bits: std::sync::atomic::AtomicU64,
    plot_count: std::sync::atomic::AtomicUsize,
}

impl Default for UiRuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl UiRuntimeContext {
    pub fn new() -> Self {
        Self {
            frame_callbacks: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
            frame_number: AtomicU64::new(0),
            delta_time_bits: std::sync::atomic::AtomicU64::new(0),
            plot_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn register_alert(&self, name: &str, cond: FnPtr, action: FnPtr, cooldown_s: f64) {
        self.alerts.lock().expect("alert registry mutex poisoned").push(Alert {
            name: name.to_string(),
            cond,
            action,
            cooldown_s: cooldown_s.max(0.0),
            last_triggered_at: None,
        });
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Acquire)
    }

    pub fn delta_time(&self) -> f64 {
        f64::from_bits(self.delta_time_bits.load(Ordering::Acquire))
    }

    pub fn plot_count(&self) -> usize {
        self.plot_count.load(Ordering::Acquire)
    }

    pub fn set_plot_count(&self, count: usize) {
        self.plot_count.store(count, Ordering::Release);
    }

    /// Advances the frame counter and records this frame's delta time,
    /// called once by the manager before running frame callbacks.
    pub fn begin_frame(&self, delta_time: f64) -> u64 {
        self.delta_time_bits.store(delta_time.to_bits(), Ordering::Release);
        self.frame_number.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn take_frame_callbacks(&self) -> Vec<FnPtr> {
        self.frame_callbacks.lock().expect("frame callback mutex poisoned").clone()
    }

    /// Evaluates every alert's condition for this frame's `now`, using
    /// `eval_cond`/`run_action` to actually call into the interpreter
    /// (kept generic so this module doesn't need to know about `rhai::Engine`
    /// or `AST` directly). Returns the names of alerts whose action fired.
    pub fn poll_alerts(
        &self,
        now: f64,
        mut eval_cond: impl FnMut(&FnPtr) -> bool,
        mut run_action: impl FnMut(&FnPtr),
    ) -> Vec<String> {
        let mut fired = Vec::new();
        let mut alerts = self.alerts.lock().expect("alert registry mutex poisoned");
        for alert in alerts.iter_mut() {
            if !eval_cond(&alert.cond) {
                continue;
            }
            let due = match alert.last_triggered_at {
                None => true,
                Some(last) => now - last >= alert.cooldown_s,
            };
            if due {
                run_action(&alert.action);
                alert.last_triggered_at = Some(now);
                fired.push(alert.name.clone());
            }
        }
        fired
    }
}
