//! Configuration resolution for taskflow.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/taskflow/settings.json)
//! 3. Project config (.taskflow/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete taskflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
    #[serde(default)]
    pub cancellation: CancellationConfig,
    #[serde(default)]
    pub callbacks: CallbackDefaults,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
        }
    }
}

/// Permission gating configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// How long a permission request waits for a decision (seconds).
    pub decision_timeout_secs: u64,
    /// Broadcast capacity for permission events.
    pub event_capacity: usize,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            decision_timeout_secs: 5 * 60,
            event_capacity: 256,
        }
    }
}

/// Stop/cancellation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationConfig {
    /// Poll interval of the cancellation monitor (milliseconds).
    pub poll_interval_ms: u64,
    /// How long `stop` waits for the active invocation to wind down (seconds).
    pub stop_wait_timeout_secs: u64,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            stop_wait_timeout_secs: 30,
        }
    }
}

/// Fallback values for parent callbacks when neither the child nor the
/// parent session configures them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackDefaults {
    pub enabled: bool,
    pub include_original_prompt: bool,
    pub include_last_message: bool,
    /// Overrides the built-in callback template.
    pub template: Option<String>,
}

impl Default for CallbackDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            include_original_prompt: false,
            include_last_message: true,
            template: None,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global_path) = global_config_path() {
        layers.push(global_path);
    }
    if let Some(dir) = project_dir {
        layers.push(dir.join(".taskflow").join("settings.json"));
    }

    let mut config = load_layered(&layers)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Merge the settings files that exist, later files overriding earlier ones
/// field by field.
pub fn load_layered(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());
    for path in paths.iter().filter(|p| p.exists()) {
        merge_config(&mut merged, read_config_value(path)?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Get the default database path for the daemon.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("taskflow.db"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".taskflow"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/taskflow"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("taskflow"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read and parse a single settings file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    serde_json::from_value(read_config_value(path)?).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn read_config_value(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay `overlay` onto `base`. Objects merge key by key; any other value
/// replaces what was there. An explicit `null` clears the field.
fn merge_config(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_config(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("TASKFLOW_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("TASKFLOW_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("TASKFLOW_PERMISSION_TIMEOUT") {
        if let Ok(n) = val.parse() {
            config.permissions.decision_timeout_secs = n;
        }
    }
    if let Ok(val) = std::env::var("TASKFLOW_POLL_INTERVAL_MS") {
        if let Ok(n) = val.parse() {
            config.cancellation.poll_interval_ms = n;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_permission_timeout_is_five_minutes() {
        let config = Config::default();
        assert_eq!(config.permissions.decision_timeout_secs, 300);
    }

    #[test]
    fn default_poll_interval_is_100ms() {
        let config = Config::default();
        assert_eq!(config.cancellation.poll_interval_ms, 100);
    }

    #[test]
    fn callback_defaults_match_hardcoded_fallback() {
        let defaults = CallbackDefaults::default();
        assert!(defaults.enabled);
        assert!(!defaults.include_original_prompt);
        assert!(defaults.include_last_message);
        assert!(defaults.template.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"permissions":{"decision_timeout_secs":10}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.permissions.decision_timeout_secs, 10);
        assert_eq!(config.permissions.event_capacity, 256);
        assert_eq!(config.cancellation.poll_interval_ms, 100);
    }

    #[test]
    fn project_file_overrides_only_the_fields_it_sets() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(
            &global,
            r#"{
                "daemon": {"log_level": "debug"},
                "permissions": {"decision_timeout_secs": 600},
                "callbacks": {"enabled": false, "template": "{{status}}"}
            }"#,
        )
        .unwrap();
        std::fs::write(
            &project,
            r#"{"daemon": {"database_path": "/tmp/project.db"}, "callbacks": {"include_original_prompt": true}}"#,
        )
        .unwrap();

        let config = load_layered(&[global, project]).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(
            config.daemon.database_path.as_deref(),
            Some(Path::new("/tmp/project.db"))
        );
        assert_eq!(config.permissions.decision_timeout_secs, 600);
        assert_eq!(config.permissions.event_capacity, 256);
        assert!(!config.callbacks.enabled);
        assert!(config.callbacks.include_original_prompt);
        assert_eq!(config.callbacks.template.as_deref(), Some("{{status}}"));
        assert_eq!(config.cancellation.stop_wait_timeout_secs, 30);
    }

    #[test]
    fn missing_layers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project.json");
        std::fs::write(&project, r#"{"cancellation": {"poll_interval_ms": 250}}"#).unwrap();

        let config = load_layered(&[dir.path().join("absent.json"), project]).unwrap();
        assert_eq!(config.cancellation.poll_interval_ms, 250);
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn null_clears_an_inherited_value() {
        let mut base = serde_json::json!({"callbacks": {"template": "{{status}}", "enabled": false}});
        merge_config(&mut base, serde_json::json!({"callbacks": {"template": null}}));
        assert_eq!(
            base,
            serde_json::json!({"callbacks": {"template": null, "enabled": false}})
        );
    }

    #[test]
    fn invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
