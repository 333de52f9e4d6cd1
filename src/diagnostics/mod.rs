use std::env as std_env;
use std::env::consts as os_consts;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, info};
use serde::Serialize;
use tokio::process::Command;

use crate::engine::models::InstallRecord;
use crate::env as app_env;
use crate::packages;
use crate::presets::Preset;
use crate::router::{self, RouterRunner};
use crate::settings::Settings;
use crate::smoke::{self, SmokeRunner};
use crate::storage::StorageManager;
use crate::version;

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub platform: PlatformInfo,
    pub router: RouterInfo,
    pub install: Option<InstallRecord>,
    pub packages: Vec<PackageStatus>,
    pub configs: Vec<ConfigStatus>,
    pub smoke: Option<SmokeSummary>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub target: String,
    pub tool_version: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RouterInfo {
    pub binary: String,
    pub path: Option<String>,
    pub version_output: Option<String>,
    pub expected_version: String,
    pub version_ok: bool,
    pub running_pids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageStatus {
    pub name: String,
    /// `dpkg-query` status line, `None` when not installed or dpkg is missing.
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigStatus {
    pub preset: String,
    pub path: String,
    pub present: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmokeSummary {
    pub success: bool,
    pub failed: Vec<String>,
    pub warnings: usize,
}

pub struct Diagnostics {
    settings: Settings,
    storage: StorageManager,
    runner: RouterRunner,
    config_dir: PathBuf,
}

impl Diagnostics {
    pub fn new(settings: Settings, storage: StorageManager) -> Self {
        let runner = RouterRunner::from_settings(&settings.router);
        let config_dir = storage.config_dir();
        Self {
            settings,
            storage,
            runner,
            config_dir,
        }
    }

    pub fn with_config_dir(mut self, dir: PathBuf) -> Self {
        self.config_dir = dir;
        self
    }

    pub async fn run(&self, with_smoke: bool) -> DiagnosticReport {
        DiagnosticReport {
            platform: platform_info(&self.storage),
            router: self.check_router().await,
            install: self.storage.read_install_record().await,
            packages: self.check_packages().await,
            configs: self.check_configs(),
            smoke: if with_smoke {
                Some(self.check_smoke().await)
            } else {
                None
            },
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn save_report(&self, report: &DiagnosticReport) -> Result<PathBuf, String> {
        info!("diagnostics: saving report");
        let logs = self.storage.logs_dir();
        fs::create_dir_all(&logs).map_err(|e| format!("unable to create logs dir: {e}"))?;

        let filename = format!(
            "doctor_{}.txt",
            report.timestamp.replace([':', ' ', '.', '+'], "-")
        );
        let path = logs.join(filename);
        fs::write(&path, format_report(report))
            .map_err(|e| format!("failed to write report: {e}"))?;
        info!("diagnostics: report written to {}", path.display());
        Ok(path)
    }

    async fn check_router(&self) -> RouterInfo {
        info!("diagnostics: checking router binary");
        let binary = self.runner.binary();
        let expected = self.settings.release.version.clone();
        let path = find_executable(binary);
        let version_output = match &path {
            Some(_) => self.runner.version().await.ok(),
            None => None,
        };
        let version_ok = version_output
            .as_deref()
            .is_some_and(|output| version::version_matches(output, &expected));
        RouterInfo {
            binary: binary.display().to_string(),
            path: path.map(|p| p.display().to_string()),
            version_output,
            expected_version: expected,
            version_ok,
            running_pids: router::running_routers(binary),
        }
    }

    async fn check_packages(&self) -> Vec<PackageStatus> {
        info!("diagnostics: checking packages");
        let mut statuses = Vec::new();
        for name in packages::package_names(&self.settings.release) {
            let status = dpkg_status(&name).await;
            debug!("diagnostics: package {} -> {:?}", name, status);
            statuses.push(PackageStatus { name, status });
        }
        statuses
    }

    fn check_configs(&self) -> Vec<ConfigStatus> {
        let dir = &self.config_dir;
        self.settings
            .router
            .presets
            .iter()
            .map(|name| {
                let file = Preset::by_name(name)
                    .map(|preset| preset.file_name())
                    .unwrap_or_else(|| format!("{name}.json5"));
                let path = dir.join(file);
                ConfigStatus {
                    preset: name.clone(),
                    present: path.exists(),
                    path: path.display().to_string(),
                }
            })
            .collect()
    }

    async fn check_smoke(&self) -> SmokeSummary {
        info!("diagnostics: running smoke checks");
        let runner = SmokeRunner::new(&self.settings.smoke);
        let report = runner
            .run(&smoke::default_checks(&self.settings.viewer))
            .await;
        SmokeSummary {
            success: report.success(),
            failed: report
                .checks
                .iter()
                .filter(|check| check.required && !check.passed())
                .map(|check| check.name.clone())
                .collect(),
            warnings: report.warnings(),
        }
    }
}

fn platform_info(storage: &StorageManager) -> PlatformInfo {
    PlatformInfo {
        os: os_consts::OS.into(),
        arch: os_consts::ARCH.into(),
        target: app_env::target_triple().into(),
        tool_version: env!("CARGO_PKG_VERSION").into(),
        data_dir: storage.base_dir().display().to_string(),
    }
}

/// Resolve `binary` the way the shell would: paths as-is, bare names via `PATH`.
pub fn find_executable(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    let paths = std_env::var_os("PATH")?;
    std_env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

async fn dpkg_status(package: &str) -> Option<String> {
    let output = Command::new("dpkg-query")
        .arg("-W")
        .arg("-f=${Status} ${Version}")
        .arg(package)
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_dpkg_status(&String::from_utf8_lossy(&output.stdout))
}

fn parse_dpkg_status(output: &str) -> Option<String> {
    let line = output.trim();
    line.starts_with("install ok installed").then(|| line.to_owned())
}

pub fn format_report(report: &DiagnosticReport) -> String {
    let mut output = String::new();

    let yes_no = |value| if value { "yes" } else { "no" };
    let status = |value| if value { "OK" } else { "FAILED" };
    let fallback = |value: &Option<String>, placeholder: &str| {
        value
            .as_deref()
            .map(str::to_owned)
            .unwrap_or_else(|| placeholder.to_owned())
    };

    let packages_ok = report.packages.iter().all(|pkg| pkg.status.is_some());
    let configs_ok = report.configs.iter().all(|cfg| cfg.present);

    let _ = writeln!(&mut output, "zenohd-setup Diagnostic Report");
    let _ = writeln!(&mut output, "Generated: {}", report.timestamp);
    let _ = writeln!(
        &mut output,
        "Summary: router={} | packages={} | configs={} | running={}{}",
        status(report.router.version_ok),
        status(packages_ok),
        status(configs_ok),
        yes_no(!report.router.running_pids.is_empty()),
        report
            .smoke
            .as_ref()
            .map(|smoke| format!(" | smoke={}", status(smoke.success)))
            .unwrap_or_default(),
    );

    let _ = writeln!(&mut output, "\n=== PLATFORM ===");
    let _ = writeln!(&mut output, "OS: {}", report.platform.os);
    let _ = writeln!(&mut output, "Arch: {}", report.platform.arch);
    let _ = writeln!(&mut output, "Target: {}", report.platform.target);
    let _ = writeln!(&mut output, "Tool Version: {}", report.platform.tool_version);
    let _ = writeln!(&mut output, "Data Dir: {}", report.platform.data_dir);

    let _ = writeln!(&mut output, "\n=== ROUTER ===");
    let _ = writeln!(&mut output, "Binary: {}", report.router.binary);
    let _ = writeln!(&mut output, "Path: {}", fallback(&report.router.path, "not found"));
    let _ = writeln!(
        &mut output,
        "Version: {}",
        fallback(&report.router.version_output, "unknown")
    );
    let _ = writeln!(
        &mut output,
        "Expected: {} ({})",
        report.router.expected_version,
        status(report.router.version_ok)
    );
    let _ = writeln!(
        &mut output,
        "Running PIDs: {}",
        if report.router.running_pids.is_empty() {
            "-".to_owned()
        } else {
            router::join_pids(&report.router.running_pids)
        }
    );

    let _ = writeln!(&mut output, "\n=== INSTALL ===");
    match &report.install {
        Some(record) => {
            let _ = writeln!(&mut output, "Installed Version: {}", record.version);
            let _ = writeln!(&mut output, "Installed At: {}", record.installed_at);
            let _ = writeln!(&mut output, "Packages: {}", record.packages.join(", "));
        }
        None => {
            let _ = writeln!(&mut output, "Installed Version: none recorded");
        }
    }
    for pkg in &report.packages {
        let _ = writeln!(
            &mut output,
            "{}: {}",
            pkg.name,
            fallback(&pkg.status, "not installed")
        );
    }

    let _ = writeln!(&mut output, "\n=== CONFIGS ===");
    for cfg in &report.configs {
        let _ = writeln!(
            &mut output,
            "{}: {} ({})",
            cfg.preset,
            if cfg.present { "present" } else { "missing" },
            cfg.path
        );
    }

    if let Some(smoke) = &report.smoke {
        let _ = writeln!(&mut output, "\n=== SMOKE ===");
        let _ = writeln!(&mut output, "Result: {}", status(smoke.success));
        let _ = writeln!(
            &mut output,
            "Failed: {}",
            if smoke.failed.is_empty() {
                "-".to_owned()
            } else {
                smoke.failed.join(", ")
            }
        );
        let _ = writeln!(&mut output, "Warnings: {}", smoke.warnings);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> DiagnosticReport {
        DiagnosticReport {
            platform: PlatformInfo {
                os: "linux".into(),
                arch: "x86_64".into(),
                target: "x86_64-unknown-linux-gnu".into(),
                tool_version: "0.2.0".into(),
                data_dir: "/home/pi/.local/share/zenohd-setup".into(),
            },
            router: RouterInfo {
                binary: "zenohd".into(),
                path: Some("/usr/bin/zenohd".into()),
                version_output: Some("zenohd v1.5.0".into()),
                expected_version: "1.5.0".into(),
                version_ok: true,
                running_pids: vec![],
            },
            install: None,
            packages: vec![
                PackageStatus {
                    name: "zenohd".into(),
                    status: Some("install ok installed 1.5.0".into()),
                },
                PackageStatus {
                    name: "zenoh-plugin-webserver".into(),
                    status: None,
                },
            ],
            configs: vec![ConfigStatus {
                preset: "full".into(),
                path: "/tmp/full.json5".into(),
                present: true,
            }],
            smoke: Some(SmokeSummary {
                success: false,
                failed: vec!["status".into()],
                warnings: 2,
            }),
            timestamp: "2026-10-19T10:00:00+00:00".into(),
        }
    }

    #[test]
    fn formats_summary_and_sections() {
        let text = format_report(&report());
        assert!(text.contains(
            "Summary: router=OK | packages=FAILED | configs=OK | running=no | smoke=FAILED"
        ));
        assert!(text.contains("zenoh-plugin-webserver: not installed"));
        assert!(text.contains("Installed Version: none recorded"));
        assert!(text.contains("Failed: status"));
        assert!(text.contains("Running PIDs: -"));
    }

    #[test]
    fn saves_report_under_logs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::at(dir.path());
        let diagnostics = Diagnostics::new(Settings::embedded().unwrap(), storage);
        let path = diagnostics.save_report(&report()).unwrap();
        assert!(path.starts_with(dir.path().join("logs")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "doctor_2026-10-19T10-00-00-00-00.txt");
    }

    #[test]
    fn parses_dpkg_status_lines() {
        assert_eq!(
            parse_dpkg_status("install ok installed 1.5.0\n"),
            Some("install ok installed 1.5.0".to_owned())
        );
        assert_eq!(parse_dpkg_status("deinstall ok config-files 1.4.0"), None);
    }

    #[test]
    #[cfg(unix)]
    fn finds_executables_on_path() {
        assert!(find_executable(Path::new("sh")).is_some());
        assert!(find_executable(Path::new("definitely-not-a-binary-xyz")).is_none());
        assert!(find_executable(Path::new("/nonexistent/zenohd")).is_none());
    }

    #[test]
    fn reports_missing_configs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::at(dir.path());
        std::fs::create_dir_all(storage.config_dir()).unwrap();
        std::fs::write(storage.config_dir().join("web.json5"), "{}").unwrap();
        let diagnostics = Diagnostics::new(Settings::embedded().unwrap(), storage);
        let configs = diagnostics.check_configs();
        let present: Vec<&str> = configs
            .iter()
            .filter(|cfg| cfg.present)
            .map(|cfg| cfg.preset.as_str())
            .collect();
        assert_eq!(present, vec!["web"]);
        assert_eq!(configs.len(), 4);
    }
}
