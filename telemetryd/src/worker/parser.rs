//! Ordered parser chain and packet callbacks for one worker.

use rhai::{Engine, FnPtr, AST};

use super::buffer::PacketView;

struct RegisteredParser {
    /// Diagnostic label only; never used as a lookup key.
    name: String,
    callback: FnPtr,
}

/// Parsers tried in registration order until one claims the packet.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<RegisteredParser>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, callback: FnPtr) {
        self.parsers.push(RegisteredParser {
            name: name.into(),
            callback,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// Runs each parser in order against `view`. Returns the name of the
    /// first parser that claimed the packet, or `None` if all rejected it.
    pub fn try_parse(&self, engine: &Engine, ast: &AST, view: PacketView) -> Option<String> {
        for parser in &self.parsers {
            let claimed = parser
                .callback
                .call::<bool>(engine, ast, (view.clone(),))
                .unwrap_or_else(|err| {
                    log::warn!("parser '{}' errored: {err}", parser.name);
                    false
                });
            if claimed {
                return Some(parser.name.clone());
            }
        }
        None
    }
}

struct RegisteredCallback {
    derived_name: String,
    callback: FnPtr,
}

/// `on_packet(packet_kind, derived_name, fn)` callbacks, grouped by the
/// packet kind string a parser reports after claiming a packet.
#[derive(Default)]
pub struct PacketCallbacks {
    by_kind: std::collections::HashMap<String, Vec<RegisteredCallback>>,
}

impl PacketCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, packet_kind: impl Into<String>, derived_name: impl Into<String>, callback: FnPtr) {
        self.by_kind
            .entry(packet_kind.into())
            .or_default()
            .push(RegisteredCallback {
                derived_name: derived_name.into(),
                callback,
            });
    }

    pub fn has_callback(&self, packet_kind: &str) -> bool {
        self.by_kind.get(packet_kind).is_some_and(|v| !v.is_empty())
    }

    /// Runs every callback registered for `packet_kind`, returning
    /// `(derived_name, value)` for every callback that produced a value.
    pub fn trigger(&self, engine: &Engine, ast: &AST, packet_kind: &str, t: f64) -> Vec<(String, f64)> {
        let Some(callbacks) = self.by_kind.get(packet_kind) else {
            return Vec::new();
        };
        callbacks
            .iter()
            .filter_map(|cb| {
                match cb.callback.call::<rhai::Dynamic>(engine, ast, (t,)) {
                    Ok(value) => value.as_float().ok().or_else(|| value.as_int().ok().map(|i| i as f64)),
                    Err(err) => {
                        log::warn!("packet callback for '{}' errored: {err}", cb.derived_name);
                        None
                    }
                }
                .map(|v| (cb.derived_name.clone(), v))
            })
            .collect()
    }
}
