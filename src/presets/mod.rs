use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde_json::{Map, Value, json};

use crate::settings::RouterSettings;

pub const CONFIG_EXTENSION: &str = "json5";

/// A named row of the router configuration table, richest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub summary: &'static str,
    pub rest: bool,
    pub webserver: bool,
    pub storage_manager: bool,
    /// Emit top-level `authentication` and `congestion_control`.
    pub legacy_keys: bool,
}

const PRESETS: [Preset; 4] = [
    Preset {
        name: "full",
        summary: "REST, webserver and in-memory storage for demo/**",
        rest: true,
        webserver: true,
        storage_manager: true,
        legacy_keys: true,
    },
    Preset {
        name: "web",
        summary: "REST and webserver plugins",
        rest: true,
        webserver: true,
        storage_manager: false,
        legacy_keys: false,
    },
    Preset {
        name: "rest",
        summary: "REST plugin only",
        rest: true,
        webserver: false,
        storage_manager: false,
        legacy_keys: false,
    },
    Preset {
        name: "minimal",
        summary: "no plugins",
        rest: false,
        webserver: false,
        storage_manager: false,
        legacy_keys: false,
    },
];

impl Preset {
    pub fn all() -> &'static [Preset] {
        &PRESETS
    }

    pub fn by_name(name: &str) -> Option<Preset> {
        PRESETS
            .iter()
            .find(|preset| preset.name.eq_ignore_ascii_case(name.trim()))
            .copied()
    }

    /// Resolve an ordered list of names, failing on the first unknown one.
    pub fn resolve(names: &[String]) -> Result<Vec<Preset>, String> {
        names
            .iter()
            .map(|name| {
                Preset::by_name(name).ok_or_else(|| {
                    let known: Vec<&str> = PRESETS.iter().map(|p| p.name).collect();
                    format!("unknown preset '{name}' (known: {})", known.join(", "))
                })
            })
            .collect()
    }

    pub fn file_name(&self) -> String {
        format!("{}.{CONFIG_EXTENSION}", self.name)
    }

    pub fn plugins(&self) -> Vec<&'static str> {
        let mut plugins = Vec::new();
        if self.rest {
            plugins.push("rest");
        }
        if self.webserver {
            plugins.push("webserver");
        }
        if self.storage_manager {
            plugins.push("storage_manager");
        }
        plugins
    }
}

/// Build the router configuration document for a preset.
pub fn render(preset: &Preset, router: &RouterSettings) -> Value {
    let mut doc = Map::new();
    doc.insert("mode".into(), json!(router.mode));
    doc.insert(
        "listen".into(),
        json!({ "endpoints": router.listen_endpoints }),
    );
    if !router.connect_endpoints.is_empty() {
        doc.insert(
            "connect".into(),
            json!({ "endpoints": router.connect_endpoints }),
        );
    }

    let mut plugins = Map::new();
    if preset.rest {
        plugins.insert("rest".into(), json!({ "http_port": router.rest_port }));
    }
    if preset.webserver {
        plugins.insert(
            "webserver".into(),
            json!({ "http_port": router.webserver_port }),
        );
    }
    if preset.storage_manager {
        plugins.insert(
            "storage_manager".into(),
            json!({
                "storages": {
                    "demo": {
                        "key_expr": "demo/**",
                        "volume": { "id": "memory" }
                    }
                }
            }),
        );
    }
    if !plugins.is_empty() {
        doc.insert("plugins".into(), Value::Object(plugins));
    }

    if preset.legacy_keys {
        doc.insert("authentication".into(), json!({ "enabled": false }));
        doc.insert("congestion_control".into(), json!("drop"));
    }

    Value::Object(doc)
}

/// Serialize a rendered document as JSON5 text with a comment header.
pub fn to_json5(value: &Value, preset: &Preset) -> Result<String, String> {
    let body =
        serde_json::to_string_pretty(value).map_err(|e| format!("config encode error: {e}"))?;
    Ok(format!(
        "// zenohd configuration preset '{}': {}\n// Generated by zenohd-setup; edits are overwritten by `configure`.\n{body}\n",
        preset.name, preset.summary
    ))
}

/// Write one `<name>.json5` file per preset into `dir`.
pub fn write_all(
    dir: &Path,
    presets: &[Preset],
    router: &RouterSettings,
) -> Result<Vec<PathBuf>, String> {
    fs::create_dir_all(dir).map_err(|e| format!("unable to create config dir: {e}"))?;
    let mut written = Vec::with_capacity(presets.len());
    for preset in presets {
        let path = dir.join(preset.file_name());
        let text = to_json5(&render(preset, router), preset)?;
        fs::write(&path, text)
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
        debug!("presets: wrote {}", path.display());
        written.push(path);
    }
    info!("presets: wrote {} config(s) to {}", written.len(), dir.display());
    Ok(written)
}

/// Config paths for `presets` in `dir`, rendering any that are missing.
pub fn ensure_written(
    dir: &Path,
    presets: &[Preset],
    router: &RouterSettings,
) -> Result<Vec<PathBuf>, String> {
    let missing: Vec<Preset> = presets
        .iter()
        .filter(|preset| !dir.join(preset.file_name()).exists())
        .copied()
        .collect();
    if !missing.is_empty() {
        write_all(dir, &missing, router)?;
    }
    Ok(presets
        .iter()
        .map(|preset| dir.join(preset.file_name()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn router() -> RouterSettings {
        Settings::embedded().unwrap().router
    }

    #[test]
    fn looks_up_presets_by_name() {
        assert_eq!(Preset::by_name("WEB").map(|p| p.name), Some("web"));
        assert!(Preset::by_name("bogus").is_none());
        let err = Preset::resolve(&["full".into(), "nope".into()]).unwrap_err();
        assert!(err.contains("unknown preset 'nope'"));
    }

    #[test]
    fn full_preset_carries_every_plugin_and_legacy_key() {
        let doc = render(&Preset::by_name("full").unwrap(), &router());
        assert_eq!(doc["mode"], "router");
        assert_eq!(doc["listen"]["endpoints"][0], "tcp/0.0.0.0:7447");
        assert_eq!(doc["plugins"]["rest"]["http_port"], 8000);
        assert_eq!(doc["plugins"]["webserver"]["http_port"], 8080);
        assert_eq!(
            doc["plugins"]["storage_manager"]["storages"]["demo"]["key_expr"],
            "demo/**"
        );
        assert_eq!(doc["authentication"]["enabled"], false);
        assert_eq!(doc["congestion_control"], "drop");
        assert!(doc.get("connect").is_none());
    }

    #[test]
    fn smaller_presets_drop_plugins() {
        let rest = render(&Preset::by_name("rest").unwrap(), &router());
        let plugins = rest["plugins"].as_object().unwrap();
        assert_eq!(plugins.keys().collect::<Vec<_>>(), vec!["rest"]);
        assert!(rest.get("authentication").is_none());

        let minimal = render(&Preset::by_name("minimal").unwrap(), &router());
        assert!(minimal.get("plugins").is_none());
        assert_eq!(Preset::by_name("minimal").unwrap().plugins(), Vec::<&str>::new());
    }

    #[test]
    fn includes_connect_endpoints_when_configured() {
        let mut router = router();
        router.mode = "peer".into();
        router.connect_endpoints = vec!["tcp/192.168.1.10:7447".into()];
        let doc = render(&Preset::by_name("minimal").unwrap(), &router);
        assert_eq!(doc["mode"], "peer");
        assert_eq!(doc["connect"]["endpoints"][0], "tcp/192.168.1.10:7447");
    }

    #[test]
    fn writes_json5_files_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let presets = Preset::resolve(&["web".into(), "minimal".into()]).unwrap();
        let written = write_all(dir.path(), &presets, &router()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[0].ends_with("web.json5"));

        let text = fs::read_to_string(&written[0]).unwrap();
        assert!(text.starts_with("// zenohd configuration preset 'web'"));
        let json_start = text.find('{').unwrap();
        let parsed: Value = serde_json::from_str(&text[json_start..]).unwrap();
        assert_eq!(parsed["plugins"]["webserver"]["http_port"], 8080);
    }

    #[test]
    fn ensure_written_keeps_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("rest.json5");
        fs::write(&custom, "{ mode: 'client' }").unwrap();
        let presets = Preset::resolve(&["rest".into(), "minimal".into()]).unwrap();
        let paths = ensure_written(dir.path(), &presets, &router()).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(fs::read_to_string(&custom).unwrap(), "{ mode: 'client' }");
        assert!(dir.path().join("minimal.json5").exists());
    }
}
