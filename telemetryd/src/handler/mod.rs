//! Applies a drained `UiEventRecord` to the canonical UI widget state.
//!
//! This is step 2 of the manager's per-frame drain (§4.6): every event a
//! worker pushed onto its `EventQueue` this frame is handed here, in the
//! order it drained, and folded into the single `WidgetState` the UI
//! thread owns before that state is copied into the next `UiSnapshot`.

use telemetry_wire::{UiEventKind, UiEventRecord};

use crate::ids::WidgetIdRegistry;
use crate::queue::EventPayloads;
use crate::snapshot::WidgetState;

/// Resolves `record.title_id` back to a widget title and applies the
/// event to `state`. An id with no known name (a `RegistryFull` edge case,
/// or a stale id from a worker that outlived a `clear` the manager never
/// sees) is logged once and dropped rather than panicking the drain.
pub fn apply_event(
    state: &mut WidgetState,
    record: UiEventRecord,
    widget_ids: &WidgetIdRegistry,
    payloads: &EventPayloads,
    warn_once: impl FnOnce(&str) -> bool,
) {
    let Some(title) = widget_ids.name_of(record.title_id) else {
        if warn_once(&format!("unknown-widget-id-{}", record.title_id)) {
            log::warn!("dropping UI event for unknown widget id {}", record.title_id);
        }
        return;
    };

    match record.kind() {
        UiEventKind::SetToggle => {
            state.toggles.insert(title, record.bool_value != 0);
        }
        UiEventKind::SetText => {
            let Some(bytes) = payloads.take(record.payload_id) else {
                return;
            };
            state.text_inputs.insert(title, String::from_utf8_lossy(&bytes).into_owned());
        }
        UiEventKind::SetImageBuffer => {
            // Image buffer bytes are consumed by the (out-of-scope) image
            // decoding/rendering surface; dropping the payload here just
            // releases ownership back to the pool once read.
            let _ = payloads.take(record.payload_id);
        }
    }
}

/// Marks a button title as clicked for exactly the current frame. Called
/// by the manager itself (not by a worker) when it observes an edge from
/// the out-of-scope widget layer; kept here so the edge-reset and the
/// event-apply logic live next to each other.
pub fn reset_button_edges(state: &mut WidgetState) {
    for clicked in state.buttons_clicked.values_mut() {
        *clicked = false;
    }
}
