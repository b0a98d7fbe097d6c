use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// Per-worker hot-path counters, aggregated under one mutex.
///
/// The mutex is only ever touched on a counter increment from a worker's
/// own thread or on a periodic rollup from the HTTP status endpoint; it is
/// never held across a queue push/drain.
#[derive(Default)]
struct WorkerCounters {
    signal_updates_pushed: u64,
    signal_updates_dropped: u64,
    parser_mismatches: u64,
}

/// Global metrics for the telemetry daemon.
///
/// Aggregate counters are atomics so the hot path (pushing a
/// `SignalUpdate`, resolving a name) never blocks; the rarer
/// per-worker breakdown lives behind a small mutex.
pub struct Metrics {
    pub start_time: SystemTime,
    signal_updates_total: AtomicU64,
    signal_updates_dropped_total: AtomicU64,
    ui_events_total: AtomicU64,
    ui_events_dropped_total: AtomicU64,
    queue_full_total: AtomicU64,
    parser_mismatch_total: AtomicU64,
    unknown_name_warnings_total: AtomicU64,
    worker_join_timeouts_total: AtomicU64,
    alert_firings_total: AtomicU64,
    registry_offline_bytes_estimate: AtomicU64,
    per_worker: Mutex<HashMap<u32, WorkerCounters>>,
    warned_names: Mutex<std::collections::HashSet<String>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            signal_updates_total: AtomicU64::new(0),
            signal_updates_dropped_total: AtomicU64::new(0),
            ui_events_total: AtomicU64::new(0),
            ui_events_dropped_total: AtomicU64::new(0),
            queue_full_total: AtomicU64::new(0),
            parser_mismatch_total: AtomicU64::new(0),
            unknown_name_warnings_total: AtomicU64::new(0),
            worker_join_timeouts_total: AtomicU64::new(0),
            alert_firings_total: AtomicU64::new(0),
            registry_offline_bytes_estimate: AtomicU64::new(0),
            per_worker: Mutex::new(HashMap::new()),
            warned_names: Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn record_signal_update_pushed(&self, worker_id: u32) {
        self.signal_updates_total.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.per_worker.lock().expect("metrics mutex poisoned");
        guard.entry(worker_id).or_default().signal_updates_pushed += 1;
    }

    pub fn record_signal_update_dropped(&self, worker_id: u32) {
        self.signal_updates_dropped_total
            .fetch_add(1, Ordering::Relaxed);
        self.queue_full_total.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.per_worker.lock().expect("metrics mutex poisoned");
        guard.entry(worker_id).or_default().signal_updates_dropped += 1;
    }

    pub fn record_ui_event_pushed(&self) {
        self.ui_events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ui_event_dropped(&self) {
        self.ui_events_dropped_total.fetch_add(1, Ordering::Relaxed);
        self.queue_full_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parser_mismatch(&self, worker_id: u32) {
        self.parser_mismatch_total.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.per_worker.lock().expect("metrics mutex poisoned");
        guard.entry(worker_id).or_default().parser_mismatches += 1;
    }

    pub fn record_worker_join_timeout(&self) {
        self.worker_join_timeouts_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_firing(&self) {
        self.alert_firings_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_offline_bytes_estimate(&self, bytes: u64) {
        self.registry_offline_bytes_estimate
            .store(bytes, Ordering::Relaxed);
    }

    pub fn offline_bytes_estimate(&self) -> u64 {
        self.registry_offline_bytes_estimate.load(Ordering::Relaxed)
    }

    /// Logs a warning for an unknown signal/widget name exactly once per
    /// process lifetime, per name. Returns true the first time `name` is
    /// seen.
    pub fn warn_once(&self, name: &str) -> bool {
        let mut guard = self.warned_names.lock().expect("metrics mutex poisoned");
        if guard.insert(name.to_string()) {
            self.unknown_name_warnings_total
                .fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn signal_updates_total(&self) -> u64 {
        self.signal_updates_total.load(Ordering::Relaxed)
    }

    pub fn signal_updates_dropped_total(&self) -> u64 {
        self.signal_updates_dropped_total.load(Ordering::Relaxed)
    }

    pub fn queue_full_total(&self) -> u64 {
        self.queue_full_total.load(Ordering::Relaxed)
    }

    pub fn parser_mismatch_total(&self) -> u64 {
        self.parser_mismatch_total.load(Ordering::Relaxed)
    }

    pub fn worker_join_timeouts_total(&self) -> u64 {
        self.worker_join_timeouts_total.load(Ordering::Relaxed)
    }

    pub fn alert_firings_total(&self) -> u64 {
        self.alert_firings_total.load(Ordering::Relaxed)
    }

    /// Renders the plain-text `key value` lines served at `/metrics`.
    pub fn render_text(&self) -> String {
        format!(
            "uptime_seconds {}\n\
             signal_updates_total {}\n\
             signal_updates_dropped_total {}\n\
             ui_events_total {}\n\
             ui_events_dropped_total {}\n\
             queue_full_total {}\n\
             parser_mismatch_total {}\n\
             unknown_name_warnings_total {}\n\
             worker_join_timeouts_total {}\n\
             alert_firings_total {}\n\
             registry_offline_bytes_estimate {}\n",
            self.uptime_seconds(),
            self.signal_updates_total(),
            self.signal_updates_dropped_total(),
            self.ui_events_total.load(Ordering::Relaxed),
            self.ui_events_dropped_total.load(Ordering::Relaxed),
            self.queue_full_total(),
            self.parser_mismatch_total(),
            self.unknown_name_warnings_total.load(Ordering::Relaxed),
            self.worker_join_timeouts_total(),
            self.alert_firings_total(),
            self.offline_bytes_estimate(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
