//! Single-producer single-consumer bounded ring buffers carrying fixed-size
//! records between a worker thread and the UI thread.
//!
//! The slot protocol borrows the EMPTY/WRITING/READY vocabulary of a
//! ticket-ordered MPSC ring buffer, narrowed to the SPSC case: with exactly
//! one producer there is no reaper and no ordering validator, but the same
//! flag states make the happens-before relationship between producer and
//! consumer explicit at each slot.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

mod slot_flags {
    pub const EMPTY: u8 = 0;
    pub const WRITING: u8 = 1;
    pub const READY: u8 = 2;
}

struct Slot<T> {
    flag: AtomicU8,
    value: UnsafeCell<Option<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            flag: AtomicU8::new(slot_flags::EMPTY),
            value: UnsafeCell::new(None),
        }
    }
}

/// A bounded SPSC ring buffer. `push` is called only from the owning
/// producer thread; `drain` only from the single consumer thread. Capacity
/// is rounded up to the next power of two for cheap index masking.
pub struct SpscQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: access to each slot's UnsafeCell is serialized by the flag
// protocol: the producer is the only writer while a slot is EMPTY/WRITING,
// the consumer is the only reader once it observes READY, and the consumer
// resets the slot to EMPTY only after taking the value out.
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let slots = (0..capacity).map(|_| Slot::empty()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Attempts to push `value`. Returns `false` without blocking if the
    /// queue is full; the caller decides whether to drop or retry.
    pub fn push(&self, value: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.slots.len() {
            return false;
        }
        let idx = tail & self.mask;
        let slot = &self.slots[idx];
        slot.flag.store(slot_flags::WRITING, Ordering::Relaxed);
        unsafe {
            *slot.value.get() = Some(value);
        }
        slot.flag.store(slot_flags::READY, Ordering::Release);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Drains up to `max` records into `sink`, in FIFO order. Returns the
    /// number drained. Never blocks; an empty queue returns 0.
    pub fn drain(&self, max: usize, mut sink: impl FnMut(T)) -> usize {
        let mut drained = 0;
        let mut head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        while drained < max && head != tail {
            let idx = head & self.mask;
            let slot = &self.slots[idx];
            if slot.flag.load(Ordering::Acquire) != slot_flags::READY {
                break;
            }
            let value = unsafe { (*slot.value.get()).take() }.expect("slot marked READY without a value");
            slot.flag.store(slot_flags::EMPTY, Ordering::Release);
            sink(value);
            drained += 1;
            head = head.wrapping_add(1);
        }
        self.head.store(head, Ordering::Release);
        drained
    }

    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use telemetry_wire::{SignalUpdate, UiEventRecord};

/// Side table for the owned string/byte payloads a `UiEventRecord` may
/// reference. The record itself is fixed-size and Pod; large payloads
/// (text input contents, image buffers) live here keyed by the
/// `payload_id` the record carries.
#[derive(Default)]
pub struct EventPayloads {
    slots: std::sync::Mutex<Vec<Option<Vec<u8>>>>,
}

impl EventPayloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, bytes: Vec<u8>) -> u32 {
        let mut slots = self.slots.lock().expect("payload mutex poisoned");
        slots.push(Some(bytes));
        (slots.len() - 1) as u32
    }

    pub fn take(&self, id: u32) -> Option<Vec<u8>> {
        let mut slots = self.slots.lock().expect("payload mutex poisoned");
        slots.get_mut(id as usize).and_then(|slot| slot.take())
    }
}

/// Per-worker signal-update queue: worker is producer, UI thread is consumer.
pub type SignalQueue = SpscQueue<SignalUpdate>;

/// Per-worker UI-event queue paired with its payload side table.
pub struct EventQueue {
    pub records: SpscQueue<UiEventRecord>,
    pub payloads: EventPayloads,
}

impl EventQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: SpscQueue::with_capacity(capacity),
            payloads: EventPayloads::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_drain_preserves_fifo_order() {
        let q: SpscQueue<u32> = SpscQueue::with_capacity(8);
        for v in 0..5 {
            assert!(q.push(v));
        }
        let mut seen = Vec::new();
        let n = q.drain(10, |v| seen.push(v));
        assert_eq!(n, 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn push_fails_without_blocking_when_full() {
        let q: SpscQueue<u32> = SpscQueue::with_capacity(2);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
    }

    #[test]
    fn drain_on_empty_queue_returns_zero() {
        let q: SpscQueue<u32> = SpscQueue::with_capacity(4);
        let mut seen = Vec::new();
        assert_eq!(q.drain(10, |v| seen.push(v)), 0);
        assert!(seen.is_empty());
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let q: SpscQueue<u32> = SpscQueue::with_capacity(5);
        assert_eq!(q.capacity(), 8);
    }

    #[test]
    fn slots_are_reusable_after_drain() {
        let q: SpscQueue<u32> = SpscQueue::with_capacity(2);
        for round in 0..10 {
            assert!(q.push(round));
            let mut seen = Vec::new();
            assert_eq!(q.drain(10, |v| seen.push(v)), 1);
            assert_eq!(seen, vec![round]);
        }
    }

    #[test]
    fn event_payloads_store_and_take_once() {
        let payloads = EventPayloads::new();
        let id = payloads.store(b"hello".to_vec());
        assert_eq!(payloads.take(id), Some(b"hello".to_vec()));
        assert_eq!(payloads.take(id), None);
    }
}
