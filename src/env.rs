use std::env;
use std::fs;
use std::path::PathBuf;

const HOME_OVERRIDE: &str = "ZENOHD_SETUP_HOME";

/// Returns the root directory used by the tool; `ZENOHD_SETUP_HOME` wins when set.
pub fn default_app_dir() -> PathBuf {
    if let Some(root) = env::var_os(HOME_OVERRIDE).filter(|value| !value.is_empty()) {
        return PathBuf::from(root);
    }

    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("zenohd-setup")
}

pub fn cache_dir() -> PathBuf {
    default_app_dir().join("cache")
}

pub fn staging_dir() -> PathBuf {
    default_app_dir().join("staging")
}

pub fn config_dir() -> PathBuf {
    default_app_dir().join("config")
}

pub fn logs_dir() -> PathBuf {
    default_app_dir().join("logs")
}

pub fn viewer_dir() -> PathBuf {
    default_app_dir().join("viewer")
}

pub fn settings_path() -> PathBuf {
    default_app_dir().join("settings.json")
}

/// Create the on-disk folder layout expected by the tool.
pub fn ensure_base_dirs() -> std::io::Result<()> {
    let folders = [
        default_app_dir(),
        cache_dir(),
        staging_dir(),
        config_dir(),
        logs_dir(),
        viewer_dir(),
    ];

    for dir in folders {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Rust target triple of the host, as used in router release archive names.
pub fn target_triple() -> &'static str {
    if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
        "x86_64-unknown-linux-gnu"
    } else if cfg!(all(target_os = "linux", target_arch = "aarch64")) {
        "aarch64-unknown-linux-gnu"
    } else if cfg!(all(target_os = "linux", target_arch = "arm")) {
        "armv7-unknown-linux-gnueabihf"
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "aarch64-apple-darwin"
    } else if cfg!(target_os = "macos") {
        "x86_64-apple-darwin"
    } else if cfg!(target_os = "windows") {
        "x86_64-pc-windows-msvc"
    } else {
        "unknown"
    }
}

/// Debian architecture name of the host.
pub fn deb_arch() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "amd64"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else if cfg!(target_arch = "arm") {
        "armhf"
    } else {
        env::consts::ARCH
    }
}
