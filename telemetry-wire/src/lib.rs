//! Fixed-size record layouts shared between worker threads and the UI thread.
//!
//! These types cross the SPSC queues in `telemetryd::queue` as plain bytes,
//! so every record here is `Pod`: no pointers, no padding that isn't
//! explicitly accounted for, no drop glue.

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

/// A single append to a named signal's time series.
///
/// `signal_id` is resolved once per name via the id registry; the hot path
/// never carries the name itself.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignalUpdate {
    pub signal_id: u32,
    pub _pad: u32,
    pub time: f64,
    pub value: f64,
}

impl SignalUpdate {
    pub const fn new(signal_id: u32, time: f64, value: f64) -> Self {
        Self {
            signal_id,
            _pad: 0,
            time,
            value,
        }
    }
}

/// Tag discriminating the payload carried by a [`UiEventRecord`].
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UiEventKind {
    SetToggle = 0,
    SetText = 1,
    SetImageBuffer = 2,
}

/// Sentinel used for the owned-payload slot id when a `UiEventRecord`
/// carries no side payload (a plain toggle flip).
pub const NO_PAYLOAD: u32 = u32::MAX;

/// Fixed-size envelope for a UI event pushed from a worker.
///
/// `title_id` addresses the target widget the same way `signal_id`
/// addresses a signal: resolved once, then reused. `payload_id` is an
/// index into the event queue's side table of owned strings/byte
/// buffers (see `telemetryd::queue::EventQueue`); it is `NO_PAYLOAD` for
/// `SetToggle` with no associated data.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UiEventRecord {
    pub kind: u32,
    pub title_id: u32,
    pub payload_id: u32,
    pub bool_value: u32,
}

impl UiEventRecord {
    pub const fn toggle(title_id: u32, value: bool) -> Self {
        Self {
            kind: UiEventKind::SetToggle as u32,
            title_id,
            payload_id: NO_PAYLOAD,
            bool_value: value as u32,
        }
    }

    pub const fn text(title_id: u32, payload_id: u32) -> Self {
        Self {
            kind: UiEventKind::SetText as u32,
            title_id,
            payload_id,
            bool_value: 0,
        }
    }

    pub const fn image_buffer(title_id: u32, payload_id: u32) -> Self {
        Self {
            kind: UiEventKind::SetImageBuffer as u32,
            title_id,
            payload_id,
            bool_value: 0,
        }
    }

    pub fn kind(&self) -> UiEventKind {
        match self.kind {
            0 => UiEventKind::SetToggle,
            1 => UiEventKind::SetText,
            _ => UiEventKind::SetImageBuffer,
        }
    }
}
