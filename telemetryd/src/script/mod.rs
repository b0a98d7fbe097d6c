//! Embedded scripting host: engine construction and the restricted native
//! API surface described for worker scripts. The UI-thread runtime layers
//! an additional superset of bindings on top (see `install_ui_bindings`).

use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Position};
use telemetry_wire::UiEventRecord;

use crate::signal::StorageMode;
use crate::worker::buffer::{bytes_to_hex, PacketView};
use crate::worker::scheduler::SuspendHandle;
use crate::worker::ScriptContext;

thread_local! {
    /// The suspension handle for whichever task is currently executing on
    /// this OS thread. Set once by the task's runner before it starts
    /// evaluating script, cleared when the task finishes.
    static CURRENT_SUSPEND: RefCell<Option<SuspendHandle>> = const { RefCell::new(None) };
}

pub fn with_current_suspend<T>(handle: SuspendHandle, body: impl FnOnce() -> T) -> T {
    CURRENT_SUSPEND.with(|slot| *slot.borrow_mut() = Some(handle));
    let result = body();
    CURRENT_SUSPEND.with(|slot| *slot.borrow_mut() = None);
    result
}

fn current_suspend() -> Option<SuspendHandle> {
    CURRENT_SUSPEND.with(|slot| slot.borrow().clone())
}

fn runtime_err(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(message.into().into(), Position::NONE))
}

fn script_err_to_eval(err: crate::errors::ScriptError) -> Box<EvalAltResult> {
    runtime_err(err.to_string())
}

/// Builds an engine with the restricted worker-side API bound to `ctx`.
pub fn build_engine(ctx: Arc<ScriptContext>) -> Engine {
    let mut engine = Engine::new();
    engine.register_type_with_name::<PacketView>("PacketView");
    engine.register_fn("len", PacketView::len);
    engine.register_fn("read_u8", PacketView::read_u8);
    engine.register_fn("read_i8", PacketView::read_i8);
    engine.register_fn("read_u16", PacketView::read_u16);
    engine.register_fn("read_i16", PacketView::read_i16);
    engine.register_fn("read_u32", PacketView::read_u32);
    engine.register_fn("read_i32", PacketView::read_i32);
    engine.register_fn("read_u64", PacketView::read_u64);
    engine.register_fn("read_float", PacketView::read_float);
    engine.register_fn("read_double", PacketView::read_double);
    engine.register_fn("read_string", PacketView::read_string);
    engine.register_fn("read_cstring", PacketView::read_cstring);
    engine.register_fn("bytes_to_hex", |blob: rhai::Blob| bytes_to_hex(&blob));

    install_time_and_threading(&mut engine, ctx.clone());
    install_signal_api(&mut engine, ctx.clone());
    install_parser_api(&mut engine, ctx.clone());
    install_ui_read_api(&mut engine, ctx.clone());
    install_ui_write_api(&mut engine, ctx.clone());
    install_cleanup_api(&mut engine, ctx);
    engine
}

fn install_time_and_threading(engine: &mut Engine, ctx: Arc<ScriptContext>) {
    engine.register_fn("current_time_seconds", || {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    });

    engine.register_fn("sleep_seconds", |seconds: f64| -> Result<(), Box<EvalAltResult>> {
        let Some(handle) = current_suspend() else {
            return Err(runtime_err("sleep_seconds called outside a task"));
        };
        handle.sleep_seconds(seconds).map_err(script_err_to_eval)
    });

    engine.register_fn("yield", || -> Result<(), Box<EvalAltResult>> {
        let Some(handle) = current_suspend() else {
            return Err(runtime_err("yield called outside a task"));
        };
        handle.yield_now().map_err(script_err_to_eval)
    });

    let ctx2 = ctx.clone();
    engine.register_fn("spawn_task", move |f: FnPtr| {
        ctx2.pending_spawns.lock().expect("pending spawns mutex poisoned").push(f);
    });

    engine.register_fn("is_app_running", move || ctx.app_running.load(Ordering::Acquire));
}

fn install_signal_api(engine: &mut Engine, ctx: Arc<ScriptContext>) {
    let c = ctx.clone();
    engine.register_fn("get_signal_id", move |name: &str| -> i64 {
        c.signal_registry.get_or_create_id(name, None) as i64
    });

    let c = ctx.clone();
    engine.register_fn("create_signal", move |name: &str| {
        c.signal_registry.get_or_create_id(name, None);
    });

    let c = ctx.clone();
    engine.register_fn("update_signal", move |name: &str, t: f64, v: f64| {
        let id = c.signal_registry.get_or_create_id(name, None);
        push_signal_update(&c, id, t, v);
    });

    let c = ctx.clone();
    engine.register_fn("update_signal_fast", move |id: i64, t: f64, v: f64| {
        push_signal_update(&c, id as u32, t, v);
    });

    let c = ctx.clone();
    engine.register_fn("get_signal", move |name: &str| -> Dynamic {
        if !c.signal_registry.exists(name) {
            if c.metrics.warn_once(name) {
                log::warn!("get_signal: unknown signal '{name}'");
            }
            return Dynamic::UNIT;
        }
        let id = c.signal_registry.get_or_create_id(name, None);
        match c.signal_registry.snapshot_tail(id) {
            Some((_, v)) => Dynamic::from_float(v),
            None => Dynamic::UNIT,
        }
    });

    let c = ctx.clone();
    engine.register_fn("get_signal_history", move |name: &str, n: i64| -> rhai::Array {
        let id = c.signal_registry.get_or_create_id(name, None);
        c.signal_registry
            .snapshot_window(id, n.max(0) as usize)
            .into_iter()
            .map(|(t, v)| {
                let mut pair = rhai::Array::new();
                pair.push(Dynamic::from_float(t));
                pair.push(Dynamic::from_float(v));
                Dynamic::from_array(pair)
            })
            .collect()
    });

    let c = ctx.clone();
    engine.register_fn("signal_exists", move |name: &str| c.signal_registry.exists(name));

    let c = ctx.clone();
    engine.register_fn("is_signal_active", move |name: &str| {
        if !c.signal_registry.exists(name) {
            return false;
        }
        let id = c.signal_registry.get_or_create_id(name, None);
        c.signal_registry.is_active(id)
    });

    let c = ctx.clone();
    engine.register_fn("clear_all_signals", move || {
        c.signal_registry.clear_all(c.signal_registry.default_mode());
    });

    let c = ctx;
    engine.register_fn("set_default_signal_mode", move |mode: &str| {
        let mode = if mode.eq_ignore_ascii_case("offline") {
            StorageMode::Offline
        } else {
            StorageMode::Live
        };
        c.signal_registry.clear_all(mode);
    });
}

pub(crate) fn push_signal_update(ctx: &ScriptContext, id: u32, t: f64, v: f64) {
    let update = telemetry_wire::SignalUpdate::new(id, t, v);
    if ctx.signal_queue.push(update) {
        ctx.metrics.record_signal_update_pushed(ctx.worker_id);
    } else {
        ctx.metrics.record_signal_update_dropped(ctx.worker_id);
    }
}

fn install_parser_api(engine: &mut Engine, ctx: Arc<ScriptContext>) {
    let c = ctx.clone();
    engine.register_fn("register_parser", move |name: &str, f: FnPtr| {
        c.parsers.lock().expect("parser registry mutex poisoned").register(name, f);
    });

    let c = ctx.clone();
    engine.register_fn("has_packet_callback", move |kind: &str| {
        c.packet_callbacks
            .lock()
            .expect("packet callback mutex poisoned")
            .has_callback(kind)
    });

    let c = ctx;
    engine.register_fn("on_packet", move |kind: &str, derived_name: &str, f: FnPtr| {
        c.packet_callbacks
            .lock()
            .expect("packet callback mutex poisoned")
            .register(kind, derived_name, f);
    });
}

fn install_ui_read_api(engine: &mut Engine, ctx: Arc<ScriptContext>) {
    let c = ctx.clone();
    engine.register_fn("get_toggle_state", move |title: &str| c.snapshot.read().toggle(title));

    let c = ctx.clone();
    engine.register_fn("get_text_input", move |title: &str| {
        c.snapshot.read().text(title).unwrap_or("").to_string()
    });

    let c = ctx;
    engine.register_fn("get_button_clicked", move |title: &str| c.snapshot.read().button_clicked(title));
}

fn install_ui_write_api(engine: &mut Engine, ctx: Arc<ScriptContext>) {
    let c = ctx.clone();
    engine.register_fn("set_toggle_state", move |title: &str, value: bool| -> Result<(), Box<EvalAltResult>> {
        push_ui_event(&c, UiEventRecord::toggle(widget_id(&c, title)?, value));
        Ok(())
    });

    let c = ctx.clone();
    engine.register_fn("set_text_input", move |title: &str, value: &str| -> Result<(), Box<EvalAltResult>> {
        let payload_id = c.event_queue.payloads.store(value.as_bytes().to_vec());
        push_ui_event(&c, UiEventRecord::text(widget_id(&c, title)?, payload_id));
        Ok(())
    });

    let c = ctx;
    engine.register_fn("set_image_buffer", move |title: &str, bytes: rhai::Blob| -> Result<(), Box<EvalAltResult>> {
        let payload_id = c.event_queue.payloads.store(bytes);
        push_ui_event(&c, UiEventRecord::image_buffer(widget_id(&c, title)?, payload_id));
        Ok(())
    });
}

/// Resolves `title` to its widget id. Id-space exhaustion is fatal to the
/// calling script rather than a value to silently fall back from (unlike
/// `get_signal`'s absent-sentinel convention).
fn widget_id(ctx: &ScriptContext, title: &str) -> Result<u32, Box<EvalAltResult>> {
    ctx.widget_ids.get_or_create_id(title).map_err(|err| runtime_err(err.to_string()))
}

fn push_ui_event(ctx: &ScriptContext, record: UiEventRecord) {
    if ctx.event_queue.records.push(record) {
        ctx.metrics.record_ui_event_pushed();
    } else {
        ctx.metrics.record_ui_event_dropped();
    }
}

fn install_cleanup_api(engine: &mut Engine, ctx: Arc<ScriptContext>) {
    engine.register_fn("on_cleanup", move |f: FnPtr| {
        ctx.cleanups.lock().expect("cleanup list mutex poisoned").push(f);
    });
}

/// Adds the UI-thread-only superset: frame callbacks, alerts, and frame
/// introspection. Called in addition to `build_engine`'s bindings when
/// constructing the UI runtime's engine.
pub fn install_ui_bindings(engine: &mut Engine, ctx: Arc<crate::alerts::UiRuntimeContext>) {
    let c = ctx.clone();
    engine.register_fn("on_frame", move |f: FnPtr| {
        c.frame_callbacks.lock().expect("frame callback mutex poisoned").push(f);
    });

    let c = ctx.clone();
    engine.register_fn(
        "on_alert",
        move |name: &str, cond: FnPtr, action: FnPtr, cooldown_s: f64| {
            c.register_alert(name, cond, action, cooldown_s);
        },
    );

    let c = ctx.clone();
    engine.register_fn("get_frame_number", move || c.frame_number() as i64);

    let c = ctx.clone();
    engine.register_fn("get_delta_time", move || c.delta_time());

    let c = ctx;
    engine.register_fn("get_plot_count", move || c.plot_count() as i64);
}
