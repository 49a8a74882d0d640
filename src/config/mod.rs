//! Host configuration
//!
//! Configuration is pulled from the process environment through [`ConfigService`]
//! and condensed into the typed [`HostConfig`] the lifecycle engine consumes.
//! Explicit builder settings always win over environment values.

use dashmap::DashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Environment key enabling development mode (hot reload).
pub const DEVELOPMENT_KEY: &str = "PORTICO_DEVELOPMENT";
/// Environment key holding comma-separated watch path patterns.
pub const WATCH_PATHS_KEY: &str = "PORTICO_WATCH_PATHS";
/// Environment key bounding the module-loading phase, in milliseconds.
pub const STARTUP_TIMEOUT_KEY: &str = "PORTICO_STARTUP_TIMEOUT_MS";
/// Environment key bounding application teardown, in milliseconds.
pub const SHUTDOWN_TIMEOUT_KEY: &str = "PORTICO_SHUTDOWN_TIMEOUT_MS";

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Key/value configuration store seeded from the process environment
#[derive(Clone, Default)]
pub struct ConfigService {
    config: Arc<DashMap<String, String>>,
}

impl ConfigService {
    pub fn new() -> Self {
        let service = Self::default();
        for (key, value) in env::vars() {
            service.set(&key, &value);
        }
        service
    }

    /// An empty store, ignoring the process environment.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.config.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.config.insert(key.to_string(), value.to_string());
    }
}

/// Typed settings consumed by the lifecycle controller
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Development mode enables dynamic module resolution and hot reload.
    pub development: bool,
    /// Substring patterns selecting the directories to watch for changes.
    pub watch_paths: Vec<String>,
    /// Upper bound on the whole module-loading phase of a start or reload.
    pub startup_timeout: Duration,
    /// Upper bound on cancelling and joining an application's task scope.
    pub shutdown_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            development: false,
            watch_paths: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl HostConfig {
    /// Read settings out of a [`ConfigService`], falling back to defaults
    /// for missing or unparsable values.
    pub fn from_config(config: &ConfigService) -> Self {
        let defaults = Self::default();
        Self {
            development: config
                .get(DEVELOPMENT_KEY)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(defaults.development),
            watch_paths: config
                .get(WATCH_PATHS_KEY)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            startup_timeout: parse_millis(config.get(STARTUP_TIMEOUT_KEY))
                .unwrap_or(defaults.startup_timeout),
            shutdown_timeout: parse_millis(config.get(SHUTDOWN_TIMEOUT_KEY))
                .unwrap_or(defaults.shutdown_timeout),
        }
    }
}

fn parse_millis(value: Option<String>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let config = ConfigService::empty();
        config.set("KEY", "value");
        assert_eq!(config.get("KEY"), Some("value".to_string()));
        assert_eq!(config.get("MISSING"), None);
    }

    #[test]
    fn host_config_from_values() {
        let config = ConfigService::empty();
        config.set(DEVELOPMENT_KEY, "true");
        config.set(WATCH_PATHS_KEY, "src, templates ,");
        config.set(STARTUP_TIMEOUT_KEY, "1500");
        config.set(SHUTDOWN_TIMEOUT_KEY, "250");

        let host = HostConfig::from_config(&config);
        assert!(host.development);
        assert_eq!(host.watch_paths, vec!["src", "templates"]);
        assert_eq!(host.startup_timeout, Duration::from_millis(1500));
        assert_eq!(host.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn host_config_defaults_on_garbage() {
        let config = ConfigService::empty();
        config.set(STARTUP_TIMEOUT_KEY, "soon");

        let host = HostConfig::from_config(&config);
        assert!(!host.development);
        assert!(host.watch_paths.is_empty());
        assert_eq!(host.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
    }
}
