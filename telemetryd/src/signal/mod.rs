//! The signal registry: the shared, bounded time-series store written once
//! per frame by the UI thread and read concurrently by renderers.

mod ring;

use std::collections::HashMap;
use std::sync::Mutex;

use ring::LiveRing;

use crate::errors::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Live,
    Offline,
}

enum Storage {
    Live(LiveRing),
    Offline { xs: Vec<f64>, ys: Vec<f64> },
}

impl Storage {
    fn new(mode: StorageMode, live_capacity: usize) -> Self {
        match mode {
            StorageMode::Live => Storage::Live(LiveRing::with_capacity(live_capacity)),
            StorageMode::Offline => Storage::Offline {
                xs: Vec::new(),
                ys: Vec::new(),
            },
        }
    }

    fn mode(&self) -> StorageMode {
        match self {
            Storage::Live(_) => StorageMode::Live,
            Storage::Offline { .. } => StorageMode::Offline,
        }
    }

    fn push(&mut self, x: f64, y: f64) {
        match self {
            Storage::Live(ring) => ring.push(x, y),
            Storage::Offline { xs, ys } => {
                xs.push(x);
                ys.push(y);
            }
        }
    }

    fn tail(&self) -> Option<(f64, f64)> {
        match self {
            Storage::Live(ring) => ring.tail(),
            Storage::Offline { xs, ys } => {
                let last = xs.len().checked_sub(1)?;
                Some((xs[last], ys[last]))
            }
        }
    }

    fn window(&self, n: usize) -> Vec<(f64, f64)> {
        match self {
            Storage::Live(ring) => ring.window(n),
            Storage::Offline { xs, ys } => {
                let start = xs.len().saturating_sub(n);
                xs[start..].iter().copied().zip(ys[start..].iter().copied()).collect()
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::Live(ring) => ring.len(),
            Storage::Offline { xs, .. } => xs.len(),
        }
    }

    fn byte_estimate(&self) -> u64 {
        match self {
            Storage::Live(_) => 0,
            Storage::Offline { xs, ys } => {
                ((xs.capacity() + ys.capacity()) * std::mem::size_of::<f64>()) as u64
            }
        }
    }
}

struct Signal {
    storage: Storage,
    /// true if referenced by an active plot or packet callback; scripts
    /// use this to skip redundant work for signals nobody observes.
    active: bool,
}

struct RegistryState {
    by_name: HashMap<String, u32>,
    signals: Vec<Signal>,
    default_mode: StorageMode,
}

/// Shared time-series store. A single mutex protects the name map and
/// signal set; it is held only for the duration of a read or write, never
/// across script execution or blocking I/O.
pub struct SignalRegistry {
    state: Mutex<RegistryState>,
    live_capacity: usize,
}

impl SignalRegistry {
    pub fn new(default_mode: StorageMode, live_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                by_name: HashMap::new(),
                signals: Vec::new(),
                default_mode,
            }),
            live_capacity,
        }
    }

    pub fn get_or_create_id(&self, name: &str, initial_mode: Option<StorageMode>) -> u32 {
        let mut state = self.state.lock().expect("registry mutex poisoned");
        if let Some(&id) = state.by_name.get(name) {
            return id;
        }
        let mode = initial_mode.unwrap_or(state.default_mode);
        let id = state.signals.len() as u32;
        state.signals.push(Signal {
            storage: Storage::new(mode, self.live_capacity),
            active: false,
        });
        state.by_name.insert(name.to_string(), id);
        id
    }

    pub fn exists(&self, name: &str) -> bool {
        let state = self.state.lock().expect("registry mutex poisoned");
        state.by_name.contains_key(name)
    }

    /// The mode signals are created in when no `initial_mode` is given,
    /// i.e. whatever the last `clear_all`/constructor call left in effect.
    pub fn default_mode(&self) -> StorageMode {
        self.state.lock().expect("registry mutex poisoned").default_mode
    }

    pub fn append(&self, id: u32, t: f64, v: f64) -> Result<(), RegistryError> {
        let mut state = self.state.lock().expect("registry mutex poisoned");
        let signal = state
            .signals
            .get_mut(id as usize)
            .ok_or(RegistryError::UnknownId(id))?;
        signal.storage.push(t, v);
        Ok(())
    }

    /// Wipes every signal's data, keeps ids stable, and sets the mode new
    /// signals will use from now on. Existing signals are recreated empty
    /// in the new mode.
    pub fn clear_all(&self, new_default_mode: StorageMode) {
        let mut state = self.state.lock().expect("registry mutex poisoned");
        state.default_mode = new_default_mode;
        for signal in state.signals.iter_mut() {
            signal.storage = Storage::new(new_default_mode, self.live_capacity);
        }
    }

    pub fn snapshot_tail(&self, id: u32) -> Option<(f64, f64)> {
        let state = self.state.lock().expect("registry mutex poisoned");
        state.signals.get(id as usize).and_then(|s| s.storage.tail())
    }

    pub fn snapshot_window(&self, id: u32, n: usize) -> Vec<(f64, f64)> {
        let state = self.state.lock().expect("registry mutex poisoned");
        state
            .signals
            .get(id as usize)
            .map(|s| s.storage.window(n))
            .unwrap_or_default()
    }

    pub fn len_of(&self, id: u32) -> usize {
        let state = self.state.lock().expect("registry mutex poisoned");
        state.signals.get(id as usize).map(|s| s.storage.len()).unwrap_or(0)
    }

    pub fn mode_of(&self, id: u32) -> Option<StorageMode> {
        let state = self.state.lock().expect("registry mutex poisoned");
        state.signals.get(id as usize).map(|s| s.storage.mode())
    }

    pub fn set_active(&self, id: u32, active: bool) {
        let mut state = self.state.lock().expect("registry mutex poisoned");
        if let Some(signal) = state.signals.get_mut(id as usize) {
            signal.active = active;
        }
    }

    pub fn is_active(&self, id: u32) -> bool {
        let state = self.state.lock().expect("registry mutex poisoned");
        state.signals.get(id as usize).map(|s| s.active).unwrap_or(false)
    }

    pub fn signal_count(&self) -> usize {
        self.state.lock().expect("registry mutex poisoned").signals.len()
    }

    /// Running estimate of heap bytes held by `Offline` signals, surfaced
    /// in `/metrics` since offline growth is unbounded by design.
    pub fn offline_bytes_estimate(&self) -> u64 {
        let state = self.state.lock().expect("registry mutex poisoned");
        state.signals.iter().map(|s| s.storage.byte_estimate()).sum()
    }
}
