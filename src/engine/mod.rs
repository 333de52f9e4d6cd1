use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::engine::models::{InstallRecord, ProvisionOutcome};
use crate::engine::state::ProvisionState;
use crate::packages::{self, InstallOptions, PackageInstaller, ProgressUpdate};
use crate::presets::{self, Preset};
use crate::router::{RouterRunner, Validation};
use crate::settings::Settings;
use crate::storage::StorageManager;
use crate::util::{CANCELLED, format_bytes};
use crate::version;

pub mod models;
pub mod state;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    pub install: InstallOptions,
    /// Skip download and install, only configure and validate.
    pub skip_install: bool,
}

pub struct ProvisionEngine {
    pub state: ProvisionState,
    settings: Settings,
    storage: StorageManager,
    installer: PackageInstaller,
    runner: RouterRunner,
    config_dir: PathBuf,
    cancel_flag: Arc<AtomicBool>,
}

impl ProvisionEngine {
    pub fn new(
        settings: Settings,
        storage: StorageManager,
        config_dir: PathBuf,
        cancel_flag: Arc<AtomicBool>,
    ) -> Self {
        let installer = PackageInstaller::new(settings.release.clone(), &storage);
        let runner = RouterRunner::from_settings(&settings.router);
        Self {
            state: ProvisionState::Idle,
            settings,
            storage,
            installer,
            runner,
            config_dir,
            cancel_flag,
        }
    }

    /// Presets in fallback order, as configured.
    pub fn presets(&self) -> Result<Vec<Preset>, String> {
        Preset::resolve(&self.settings.router.presets)
    }

    /// Download, install and verify the router packages.
    pub async fn install(
        &mut self,
        options: InstallOptions,
        updates: &mpsc::UnboundedSender<ProvisionState>,
    ) -> Result<Option<InstallRecord>, String> {
        let result = self.try_install(options, updates).await;
        if let Err(err) = &result {
            self.fail(err.clone(), updates);
            error!("install: {err}");
        }
        result
    }

    async fn try_install(
        &mut self,
        options: InstallOptions,
        updates: &mpsc::UnboundedSender<ProvisionState>,
    ) -> Result<Option<InstallRecord>, String> {
        self.reset_cancel_flag();
        let mut progress_cb = |update: ProgressUpdate| {
            if let Some(state) = progress_state(&update) {
                let _ = updates.send(state);
            }
            debug!(
                "install progress: stage={} file={:?} progress={:.1} speed={:?}",
                update.stage, update.current_file, update.progress, update.speed
            );
        };

        let debs = self
            .installer
            .prepare(Some(self.cancel_flag.clone()), Some(&mut progress_cb))
            .await?;
        if self.cancel_requested() {
            warn!("install: cancelled after download");
            return Err(CANCELLED.into());
        }

        self.transition(ProvisionState::Installing { packages: debs.len() }, updates);
        self.installer
            .install(&debs, options, Some(self.cancel_flag.clone()), None)
            .await?;
        if self.cancel_requested() {
            warn!("install: cancelled after package install");
            return Err(CANCELLED.into());
        }
        if options.dry_run {
            info!("install: dry run; skipping verification");
            return Ok(None);
        }

        self.transition(ProvisionState::Verifying, updates);
        let expected = self.installer.version().to_owned();
        let output = self.runner.version().await?;
        if !version::version_matches(&output, &expected) {
            return Err(format!(
                "installed router reports '{output}', expected version {expected}"
            ));
        }

        let record = InstallRecord {
            version: expected,
            packages: packages::package_names(&self.settings.release),
            installed_at: chrono::Utc::now().to_rfc3339(),
        };
        self.storage.write_install_record(&record).await?;
        info!("install: router {} installed", record.version);
        Ok(Some(record))
    }

    /// Render every configured preset into the config directory.
    pub fn configure(
        &mut self,
        updates: &mpsc::UnboundedSender<ProvisionState>,
    ) -> Result<Vec<PathBuf>, String> {
        self.transition(ProvisionState::Configuring, updates);
        let result = self
            .presets()
            .and_then(|list| presets::write_all(&self.config_dir, &list, &self.settings.router));
        if let Err(err) = &result {
            self.fail(err.clone(), updates);
        }
        result
    }

    /// Dry-run each config in fallback order; returns the first accepted preset.
    pub async fn validate(
        &mut self,
        configs: &[PathBuf],
        updates: &mpsc::UnboundedSender<ProvisionState>,
    ) -> Result<Option<String>, String> {
        let presets = self.presets()?;
        for (preset, config) in presets.iter().zip(configs) {
            if self.cancel_requested() {
                warn!("validate: cancelled before preset '{}'", preset.name);
                self.fail(CANCELLED.into(), updates);
                return Err(CANCELLED.into());
            }
            self.transition(
                ProvisionState::Validating {
                    preset: preset.name.to_owned(),
                },
                updates,
            );
            match self.runner.validate(config).await {
                Ok(Validation::Accepted) => return Ok(Some(preset.name.to_owned())),
                Ok(rejected) => {
                    let _ = updates.send(ProvisionState::Rejected {
                        preset: preset.name.to_owned(),
                        reason: rejected.to_string(),
                    });
                }
                Err(err) => {
                    self.fail(err.clone(), updates);
                    return Err(err);
                }
            }
        }
        warn!("validate: no preset accepted; the router will run with built-in defaults");
        Ok(None)
    }

    /// Install (unless skipped), configure and validate.
    pub async fn provision(
        &mut self,
        options: ProvisionOptions,
        updates: &mpsc::UnboundedSender<ProvisionState>,
    ) -> Result<ProvisionOutcome, String> {
        info!("provision: starting");
        if !options.skip_install {
            self.install(options.install, updates).await?;
        }
        if options.install.dry_run {
            let version = self.installer.version().to_owned();
            self.transition(
                ProvisionState::Ready {
                    version: version.clone(),
                    preset: None,
                },
                updates,
            );
            return Ok(ProvisionOutcome {
                version,
                preset: None,
                configs: Vec::new(),
            });
        }

        let configs = self.configure(updates)?;
        let preset = self.validate(&configs, updates).await?;
        let version = match self.storage.read_install_record().await {
            Some(record) => record.version,
            None => self.installer.version().to_owned(),
        };
        self.transition(
            ProvisionState::Ready {
                version: version.clone(),
                preset: preset.clone(),
            },
            updates,
        );
        info!("provision: ready (version {version}, preset {preset:?})");
        Ok(ProvisionOutcome {
            version,
            preset,
            configs,
        })
    }

    fn transition(&mut self, state: ProvisionState, updates: &mpsc::UnboundedSender<ProvisionState>) {
        self.state = state.clone();
        let _ = updates.send(state);
    }

    fn fail(&mut self, err: String, updates: &mpsc::UnboundedSender<ProvisionState>) {
        self.transition(ProvisionState::Error(err), updates);
    }

    fn reset_cancel_flag(&self) {
        self.cancel_flag.store(false, Ordering::SeqCst);
        debug!("cancel flag reset");
    }

    fn cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }
}

/// Map a package progress event to the state shown on the console.
fn progress_state(update: &ProgressUpdate) -> Option<ProvisionState> {
    let file = update
        .current_file
        .clone()
        .unwrap_or_else(|| update.stage.to_string());
    match update.stage {
        "extract" => Some(ProvisionState::Extracting { file }),
        "install" => None,
        _ => {
            let speed = update.speed.clone().unwrap_or_else(|| update.message.clone());
            let speed = match (update.downloaded, update.total) {
                (Some(done), Some(total)) => {
                    format!("{speed} ({} / {})", format_bytes(done), format_bytes(total))
                }
                (Some(done), None) => format!("{speed} ({})", format_bytes(done)),
                _ => speed,
            };
            Some(ProvisionState::Fetching {
                file,
                progress: update.progress,
                speed,
            })
        }
    }
}
