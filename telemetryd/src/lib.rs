pub mod alerts;
pub mod config;
pub mod context;
pub mod errors;
pub mod handler;
pub mod ids;
pub mod metrics;
pub mod queue;
pub mod runtime;
pub mod script;
pub mod signal;
pub mod snapshot;
pub mod worker;

pub use config::{Config, HttpConfig, LoggingConfig, QueueConfig, RegistryConfig, SchedulerConfig};
pub use context::{AppContext, WorkerManager};
pub use metrics::Metrics;
