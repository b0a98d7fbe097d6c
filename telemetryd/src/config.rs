use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/telemetryd/telemetryd.toml";
const ENV_CONFIG_PATH: &str = "TELEMETRYD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `TELEMETRYD_CONFIG` environment variable. A missing or unparsable
    /// file falls back to defaults rather than aborting startup.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("failed to parse config at {}: {err}", path.display());
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_live_capacity")]
    pub live_capacity: usize,
    #[serde(default = "default_mode")]
    pub default_mode: StorageModeConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            live_capacity: default_live_capacity(),
            default_mode: default_mode(),
        }
    }
}

fn default_live_capacity() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageModeConfig {
    Live,
    Offline,
}

fn default_mode() -> StorageModeConfig {
    StorageModeConfig::Live
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_signal_queue_capacity")]
    pub signal_queue_capacity: usize,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            signal_queue_capacity: default_signal_queue_capacity(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

fn default_signal_queue_capacity() -> usize {
    65536
}
fn default_event_queue_capacity() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: default_idle_sleep_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

fn default_idle_sleep_ms() -> u64 {
    1
}
fn default_join_timeout_ms() -> u64 {
    3_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_rust_log")]
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: default_rust_log(),
        }
    }
}

fn default_rust_log() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind: default_http_bind(),
        }
    }
}

fn default_http_enabled() -> bool {
    true
}
fn default_http_bind() -> String {
    "127.0.0.1:9090".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[registry]
live_capacity = 4000
default_mode = "live"
[queues]
signal_queue_capacity = 8192
event_queue_capacity = 256
[scheduler]
idle_sleep_ms = 2
join_timeout_ms = 5000
[http]
enabled = true
bind = "0.0.0.0:9090"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.registry.live_capacity, 4000);
        assert_eq!(cfg.registry.default_mode, StorageModeConfig::Live);
        assert_eq!(cfg.queues.signal_queue_capacity, 8192);
        assert_eq!(cfg.scheduler.join_timeout_ms, 5000);
        assert_eq!(cfg.http.bind, "0.0.0.0:9090");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.registry.live_capacity, default_live_capacity());
        assert_eq!(cfg.queues.event_queue_capacity, default_event_queue_capacity());
        assert!(cfg.http.enabled);
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[registry]\nlive_capacity = 42").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.registry.live_capacity, 42);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
