use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::RegistryError;

/// Process-wide, thread-safe name-to-id allocator. ids are dense in
/// `[0, len)` and never reused within a process lifetime.
///
/// Used for UI widget titles (`WidgetIdRegistry`): widget state itself is
/// keyed by title string in `WidgetState` (operator-debuggable, written at
/// most once per frame), but the `UiEventRecord`s that cross the per-worker
/// SPSC queue carry an integer `title_id` instead, the same way a
/// `SignalUpdate` carries a `signal_id` instead of a name.
///
/// Signal names resolve to ids through `SignalRegistry::get_or_create_id`
/// directly (see `signal::SignalRegistry`) rather than through a second,
/// separate allocator: the registry already is the name-to-id map, and
/// keeping a second one in sync with it would only invite drift between
/// the id a script resolves and the id the registry actually stores data
/// under.
#[derive(Default)]
pub struct NameRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, u32>,
    names: Vec<String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: repeated calls with the same name return the same id.
    pub fn get_or_create_id(&self, name: &str) -> Result<u32, RegistryError> {
        let mut inner = self.inner.lock().expect("id registry mutex poisoned");
        if let Some(&id) = inner.by_name.get(name) {
            return Ok(id);
        }
        let id = inner.names.len();
        if id >= u32::MAX as usize {
            return Err(RegistryError::RegistryFull);
        }
        let id = id as u32;
        inner.by_name.insert(name.to_string(), id);
        inner.names.push(name.to_string());
        Ok(id)
    }

    pub fn name_of(&self, id: u32) -> Option<String> {
        let inner = self.inner.lock().expect("id registry mutex poisoned");
        inner.names.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("id registry mutex poisoned").names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type WidgetIdRegistry = NameRegistry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_id_is_idempotent() {
        let reg = NameRegistry::new();
        let a = reg.get_or_create_id("IMU.accelX").unwrap();
        let b = reg.get_or_create_id("IMU.accelX").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_names_get_distinct_ids() {
        let reg = NameRegistry::new();
        let a = reg.get_or_create_id("IMU.accelX").unwrap();
        let b = reg.get_or_create_id("IMU.accelY").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_dense_from_zero() {
        let reg = NameRegistry::new();
        let a = reg.get_or_create_id("a").unwrap();
        let b = reg.get_or_create_id("b").unwrap();
        let c = reg.get_or_create_id("c").unwrap();
        assert_eq!([a, b, c], [0, 1, 2]);
    }

    #[test]
    fn name_of_resolves_back_to_original_name() {
        let reg = NameRegistry::new();
        let id = reg.get_or_create_id("GPS.lat").unwrap();
        assert_eq!(reg.name_of(id).as_deref(), Some("GPS.lat"));
        assert_eq!(reg.name_of(id + 1), None);
    }
}
