use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

/// Layered configuration, merged low-to-high precedence: global (user home)
/// < project (`<projectDir>/.loom/config.json`) < environment < runtime
/// overrides set programmatically for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    pub global: Value,
    pub project: Value,
    pub env: Value,
    pub runtime: Value,
}

impl ConfigLayers {
    pub fn merged(&self) -> Value {
        let mut out = json!({});
        for layer in [&self.global, &self.project, &self.env, &self.runtime] {
            deep_merge(&mut out, layer);
        }
        out
    }
}

/// Recursively merges `patch` into `base`, with `patch` winning on scalar
/// conflicts. Objects are merged key-wise; any other type replaces wholesale.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), patch_value);
            }
        }
        (base_slot, patch_value) => {
            if !patch_value.is_null() {
                *base_slot = patch_value.clone();
            }
        }
    }
}

/// Process-wide ambient configuration: dashboard exposure and the tick
/// periods / retention windows the spec nails down as defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dashboard_port: u16,
    pub enable_dashboard: bool,
    pub completion_monitor_period_secs: u64,
    pub sync_heartbeat_period_secs: u64,
    pub sync_message_retention_secs: u64,
    pub sync_instance_timeout_secs: u64,
    pub proposal_acceptance_threshold: f64,
    pub verification_timeout_secs: u64,
    pub verification_output_cap_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dashboard_port: 3456,
            enable_dashboard: true,
            completion_monitor_period_secs: 5,
            sync_heartbeat_period_secs: 30,
            sync_message_retention_secs: 300,
            sync_instance_timeout_secs: 90,
            proposal_acceptance_threshold: 70.0,
            verification_timeout_secs: 300,
            verification_output_cap_bytes: 10 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// The core consults exactly `DASHBOARD_PORT` and `ENABLE_DASHBOARD`;
    /// every other env var is ignored, per the spec's explicit boundary.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(port) = std::env::var("DASHBOARD_PORT") {
            if let Ok(parsed) = port.parse() {
                cfg.dashboard_port = parsed;
            }
        }
        if let Ok(enabled) = std::env::var("ENABLE_DASHBOARD") {
            cfg.enable_dashboard = !matches!(enabled.as_str(), "0" | "false" | "no");
        }
        cfg
    }

    pub fn env_layer() -> HashMap<&'static str, String> {
        let mut layer = HashMap::new();
        if let Ok(v) = std::env::var("DASHBOARD_PORT") {
            layer.insert("dashboardPort", v);
        }
        if let Ok(v) = std::env::var("ENABLE_DASHBOARD") {
            layer.insert("enableDashboard", v);
        }
        layer
    }
}

/// Reads and merges config layers from disk; missing or corrupt files fall
/// back to an empty layer rather than erroring, matching the store-wide
/// "exists with fallback" idiom.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    global_path: Option<PathBuf>,
    project_path: PathBuf,
}

impl ConfigStore {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            global_path: dirs::home_dir().map(|h| h.join(".loom").join("config.json")),
            project_path: project_dir.join(".loom").join("config.json"),
        }
    }

    pub async fn load(&self) -> ConfigLayers {
        let global = self
            .global_path
            .as_deref()
            .map(read_json_or_empty)
            .unwrap_or(json!({}));
        let project = read_json_or_empty(&self.project_path);
        ConfigLayers {
            global: global.await,
            project: project.await,
            env: json!({}),
            runtime: json!({}),
        }
    }
}

async fn read_json_or_empty(path: &Path) -> Value {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|_| json!({})),
        Err(_) => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overrides_scalars_and_merges_objects() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let patch = json!({"a": 2, "nested": {"y": 3, "z": 4}});
        deep_merge(&mut base, &patch);
        assert_eq!(base["a"], 2);
        assert_eq!(base["nested"]["x"], 1);
        assert_eq!(base["nested"]["y"], 3);
        assert_eq!(base["nested"]["z"], 4);
    }

    #[test]
    fn engine_config_defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.dashboard_port, 3456);
        assert!(cfg.enable_dashboard);
    }

    #[tokio::test]
    async fn config_store_falls_back_to_empty_on_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let layers = store.load().await;
        assert_eq!(layers.project, json!({}));
    }
}
