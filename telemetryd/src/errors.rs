//! Error taxonomy for the telemetry data plane.
//!
//! Each variant corresponds to one of the conditions enumerated for the
//! error handling design: most are recoverable and are logged at the call
//! site rather than propagated out of the runtime.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("signal id {0} is not registered")]
    UnknownId(u32),
    #[error("signal id space exhausted")]
    RegistryFull,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script runtime error in {function}: {message}")]
    Runtime { function: String, message: String },
    #[error("bootstrap script failed to load: {0}")]
    BootstrapFailed(String),
    #[error("byte read out of bounds: offset {offset} + size {size} > len {len}")]
    BufferBounds {
        offset: usize,
        size: usize,
        len: usize,
    },
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {0} did not join within the configured timeout")]
    JoinTimeout(u32),
    #[error(transparent)]
    Script(#[from] ScriptError),
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("cleanup callback failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_bounds_message_reports_all_fields() {
        let err = ScriptError::BufferBounds {
            offset: 10,
            size: 8,
            len: 12,
        };
        let text = err.to_string();
        assert!(text.contains("10"));
        assert!(text.contains('8'));
        assert!(text.contains("12"));
    }

    #[test]
    fn worker_error_wraps_script_error() {
        let script_err = ScriptError::BootstrapFailed("missing file".into());
        let worker_err: WorkerError = script_err.into();
        assert!(matches!(worker_err, WorkerError::Script(_)));
    }
}
