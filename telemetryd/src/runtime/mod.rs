//! The UI-thread script runtime: the restricted worker API plus the
//! UI-only superset (`on_frame`, `on_alert`, frame introspection), driven
//! inline by the manager once per frame rather than on its own OS thread.

pub mod ui_runtime;

pub use ui_runtime::UiRuntime;
