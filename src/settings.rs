use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::env;

const EMBEDDED_SETTINGS: &str = include_str!("../settings.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub release: ReleaseSettings,
    pub router: RouterSettings,
    pub smoke: SmokeSettings,
    pub viewer: ViewerSettings,
    pub install: InstallSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSettings {
    pub version: String,
    pub archives: Vec<ArchiveSource>,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    pub binary: String,
    pub mode: String,
    pub listen_endpoints: Vec<String>,
    #[serde(default)]
    pub connect_endpoints: Vec<String>,
    pub rest_port: u16,
    pub webserver_port: u16,
    pub presets: Vec<String>,
    pub liveness_delay_secs: u64,
    pub validate_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmokeSettings {
    pub rest_url: String,
    pub webserver_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerSettings {
    pub rgb_key: String,
    pub depth_key: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSettings {
    pub use_sudo: bool,
}

impl Settings {
    /// Built-in defaults compiled into the binary.
    pub fn embedded() -> Result<Self, String> {
        serde_json::from_str(EMBEDDED_SETTINGS)
            .map_err(|e| format!("embedded settings parse error: {e}"))
    }

    /// Load defaults overlaid with `<app_dir>/settings.json` when present.
    pub fn load() -> Result<Self, String> {
        Self::load_from(&env::settings_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, String> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => {
                debug!("settings: no local file at {}, using defaults", path.display());
                return Self::embedded();
            }
        };

        match Self::overlay(&contents) {
            Ok(settings) => {
                debug!("settings: loaded {}", path.display());
                Ok(settings)
            }
            Err(err) => {
                warn!(
                    "settings: ignoring {} ({err}); using embedded defaults",
                    path.display()
                );
                Self::embedded()
            }
        }
    }

    /// Load a file named on the command line; unlike `load_from`, a missing
    /// or malformed file is an error.
    pub fn load_required(path: &Path) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("unable to read settings file {}: {e}", path.display()))?;
        let settings = Self::overlay(&contents).map_err(|e| format!("{}: {e}", path.display()))?;
        debug!("settings: loaded {}", path.display());
        Ok(settings)
    }

    /// Parse a partial settings document on top of the embedded defaults.
    pub fn overlay(contents: &str) -> Result<Self, String> {
        let mut base: Value = serde_json::from_str(EMBEDDED_SETTINGS)
            .map_err(|e| format!("embedded settings parse error: {e}"))?;
        let local: Value =
            serde_json::from_str(contents).map_err(|e| format!("settings parse error: {e}"))?;
        merge(&mut base, local);
        serde_json::from_value(base).map_err(|e| format!("settings shape error: {e}"))
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse() {
        let settings = Settings::embedded().unwrap();
        assert_eq!(settings.router.binary, "zenohd");
        assert_eq!(settings.router.liveness_delay_secs, 5);
        assert_eq!(
            settings.router.presets,
            vec!["full", "web", "rest", "minimal"]
        );
        assert!(settings.router.connect_endpoints.is_empty());
        assert_eq!(settings.viewer.rgb_key, "demo/zcam/rgb");
    }

    #[test]
    fn overlay_replaces_only_given_fields() {
        let settings = Settings::overlay(
            r#"{ "release": { "version": "1.6.0" }, "router": { "connect_endpoints": ["tcp/10.0.0.1:7447"] } }"#,
        )
        .unwrap();
        assert_eq!(settings.release.version, "1.6.0");
        assert!(!settings.release.packages.is_empty());
        assert_eq!(settings.router.connect_endpoints, vec!["tcp/10.0.0.1:7447"]);
        assert_eq!(settings.router.rest_port, 8000);
    }

    #[test]
    fn falls_back_to_embedded_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.smoke.rest_url, "http://localhost:8000");

        let missing = Settings::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing.router.webserver_port, 8080);
    }

    #[test]
    fn explicit_file_must_exist_and_parse() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load_required(&dir.path().join("typo.json")).unwrap_err();
        assert!(err.starts_with("unable to read settings file"));

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        let err = Settings::load_required(&bad).unwrap_err();
        assert!(err.contains("settings parse error"));

        let good = dir.path().join("good.json");
        fs::write(&good, r#"{ "router": { "rest_port": 9000 } }"#).unwrap();
        assert_eq!(Settings::load_required(&good).unwrap().router.rest_port, 9000);
    }
}
