use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, info, warn};
use sysinfo::{ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

use crate::settings::RouterSettings;

/// Result of `<binary> -c <file> --dry-run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accepted,
    Rejected { code: Option<i32>, stderr: String },
    TimedOut,
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted)
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validation::Accepted => write!(f, "accepted"),
            Validation::Rejected { code, stderr } => {
                match code {
                    Some(code) => write!(f, "rejected (exit {code})")?,
                    None => write!(f, "rejected (killed by signal)")?,
                }
                let first = stderr.lines().find(|line| !line.trim().is_empty());
                if let Some(line) = first {
                    write!(f, ": {}", line.trim())?;
                }
                Ok(())
            }
            Validation::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Dry-run each candidate first and skip the ones the router rejects.
    pub validate_first: bool,
    /// Launch even when another router process is already running.
    pub force: bool,
}

/// One attempt of the fallback chain and why it ended.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub config: PathBuf,
    pub outcome: String,
}

/// A router that survived the liveness check.
#[derive(Debug)]
pub struct RunningRouter {
    pub child: Child,
    /// `None` when every candidate failed and the binary runs bare.
    pub config: Option<PathBuf>,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Clone)]
pub struct RouterRunner {
    binary: PathBuf,
    liveness_delay: Duration,
    validate_timeout: Duration,
}

impl RouterRunner {
    pub fn new(binary: impl Into<PathBuf>, liveness_delay: Duration, validate_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            liveness_delay,
            validate_timeout,
        }
    }

    pub fn from_settings(router: &RouterSettings) -> Self {
        Self::new(
            &router.binary,
            Duration::from_secs(router.liveness_delay_secs),
            Duration::from_secs(router.validate_timeout_secs),
        )
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Trimmed stdout of `<binary> --version`.
    pub async fn version(&self) -> Result<String, String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = timeout(self.validate_timeout, cmd.output())
            .await
            .map_err(|_| format!("{} --version timed out", self.binary.display()))?
            .map_err(|e| format!("failed to run {}: {e}", self.binary.display()))?;
        if !output.status.success() {
            return Err(format!(
                "{} --version exited with {}",
                self.binary.display(),
                output.status
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        debug!("router: version output {:?}", stdout);
        Ok(stdout)
    }

    /// Ask the router whether it accepts `config` without starting it.
    pub async fn validate(&self, config: &Path) -> Result<Validation, String> {
        debug!("router: dry-run {}", config.display());
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c")
            .arg(config)
            .arg("--dry-run")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| format!("failed to run {}: {e}", self.binary.display()))?;

        let validation = match timeout(self.validate_timeout, child.wait_with_output()).await {
            Err(_) => Validation::TimedOut,
            Ok(output) => {
                let output =
                    output.map_err(|e| format!("failed to wait for {}: {e}", self.binary.display()))?;
                if output.status.success() {
                    Validation::Accepted
                } else {
                    Validation::Rejected {
                        code: output.status.code(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    }
                }
            }
        };
        info!("router: {} {}", config.display(), validation);
        Ok(validation)
    }

    pub async fn validate_all(&self, configs: &[PathBuf]) -> Result<Vec<(PathBuf, Validation)>, String> {
        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            let validation = self.validate(config).await?;
            results.push((config.clone(), validation));
        }
        Ok(results)
    }

    /// Try each candidate in order until one survives the liveness delay;
    /// with none left, run the binary with no arguments.
    pub async fn launch_with_fallback(
        &self,
        candidates: &[PathBuf],
        options: StartOptions,
    ) -> Result<RunningRouter, String> {
        if !options.force {
            let pids = running_routers(&self.binary);
            if !pids.is_empty() {
                return Err(format!(
                    "a router is already running (pid {}); pass --force to start another",
                    join_pids(&pids)
                ));
            }
        }

        let mut attempts = Vec::new();
        for (index, config) in candidates.iter().enumerate() {
            info!(
                "router: attempt {}/{} with {}",
                index + 1,
                candidates.len(),
                config.display()
            );
            if !config.exists() {
                warn!("router: {} does not exist; skipping", config.display());
                attempts.push(Attempt {
                    config: config.clone(),
                    outcome: "missing".into(),
                });
                continue;
            }
            if options.validate_first {
                let validation = self.validate(config).await?;
                if !validation.is_accepted() {
                    attempts.push(Attempt {
                        config: config.clone(),
                        outcome: validation.to_string(),
                    });
                    continue;
                }
            }

            let mut cmd = self.command();
            cmd.arg("-c").arg(config);
            match self.spawn_and_watch(cmd).await? {
                Ok(child) => {
                    info!("router: running with {}", config.display());
                    return Ok(RunningRouter {
                        child,
                        config: Some(config.clone()),
                        attempts,
                    });
                }
                Err(status) => {
                    warn!("router: {} exited early ({status})", config.display());
                    attempts.push(Attempt {
                        config: config.clone(),
                        outcome: format!("exited early ({status})"),
                    });
                }
            }
        }

        warn!("router: all configurations failed; starting with built-in defaults");
        match self.spawn_and_watch(self.command()).await? {
            Ok(child) => Ok(RunningRouter {
                child,
                config: None,
                attempts,
            }),
            Err(status) => Err(format!(
                "{} exited early without a configuration ({status})",
                self.binary.display()
            )),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    /// Spawn, wait the liveness delay and sample liveness once.
    async fn spawn_and_watch(
        &self,
        mut cmd: Command,
    ) -> Result<Result<Child, ExitStatus>, String> {
        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.binary.display()))?;
        debug!("router: spawned pid {:?}", child.id());
        sleep(self.liveness_delay).await;
        match child.try_wait() {
            Ok(Some(status)) => Ok(Err(status)),
            Ok(None) => Ok(Ok(child)),
            Err(err) => Err(format!("failed to poll router process: {err}")),
        }
    }
}

/// Block until the router exits, or terminate it on Ctrl-C.
pub async fn wait_foreground(mut router: RunningRouter) -> Result<ExitStatus, String> {
    tokio::select! {
        status = router.child.wait() => {
            status.map_err(|e| format!("failed to wait for router: {e}"))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("router: interrupt received, stopping");
            router
                .child
                .kill()
                .await
                .map_err(|e| format!("failed to stop router: {e}"))?;
            router
                .child
                .wait()
                .await
                .map_err(|e| format!("failed to reap router: {e}"))
        }
    }
}

/// Pids of running processes whose name matches the router binary's file name.
pub fn running_routers(binary: &Path) -> Vec<u32> {
    let Some(name) = binary.file_name() else {
        return Vec::new();
    };
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut pids: Vec<u32> = system
        .processes()
        .values()
        .filter(|process| process.name() == name || process.name() == OsStr::new(&truncated(name)))
        .map(|process| process.pid().as_u32())
        .collect();
    pids.sort_unstable();
    pids
}

// Linux reports at most 15 bytes of the executable name.
fn truncated(name: &OsStr) -> String {
    name.to_string_lossy().chars().take(15).collect()
}

pub fn join_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    const FAKE_ROUTER: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "zenohd v1.5.0 built with rustc 1.85.0"
  exit 0
fi
if [ "$1" = "-c" ]; then
  if grep -q bad "$2"; then
    echo "invalid configuration: unknown key" >&2
    exit 3
  fi
  if grep -q slow "$2"; then
    sleep 30
  fi
  if [ "$3" = "--dry-run" ]; then
    exit 0
  fi
fi
exec sleep 30
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        runner: RouterRunner,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let binary = dir.path().join("fake-zenohd");
            fs::write(&binary, FAKE_ROUTER).unwrap();
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
            let runner = RouterRunner::new(
                binary,
                Duration::from_millis(300),
                Duration::from_millis(500),
            );
            Self { dir, runner }
        }

        fn config(&self, name: &str, body: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, body).unwrap();
            path
        }
    }

    #[tokio::test]
    async fn reads_version_output() {
        let fx = Fixture::new();
        let version = fx.runner.version().await.unwrap();
        assert_eq!(version, "zenohd v1.5.0 built with rustc 1.85.0");
    }

    #[tokio::test]
    async fn validates_configs_with_dry_run() {
        let fx = Fixture::new();
        let good = fx.config("good.json5", "{ mode: 'router' }");
        let bad = fx.config("bad.json5", "{ bad: true }");
        let slow = fx.config("slow.json5", "{ slow: true }");

        let results = fx.runner.validate_all(&[good, bad, slow]).await.unwrap();
        assert_eq!(results[0].1, Validation::Accepted);
        match &results[1].1 {
            Validation::Rejected { code, stderr } => {
                assert_eq!(*code, Some(3));
                assert!(stderr.contains("unknown key"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            results[1].1.to_string(),
            "rejected (exit 3): invalid configuration: unknown key"
        );
        assert_eq!(results[2].1, Validation::TimedOut);
    }

    #[tokio::test]
    async fn falls_through_to_first_surviving_config() {
        let fx = Fixture::new();
        let bad = fx.config("full.json5", "{ bad: true }");
        let missing = fx.dir.path().join("web.json5");
        let good = fx.config("rest.json5", "{ mode: 'router' }");

        let options = StartOptions {
            validate_first: false,
            force: true,
        };
        let mut running = fx
            .runner
            .launch_with_fallback(&[bad.clone(), missing, good.clone()], options)
            .await
            .unwrap();
        assert_eq!(running.config.as_deref(), Some(good.as_path()));
        assert_eq!(running.attempts.len(), 2);
        assert_eq!(running.attempts[0].config, bad);
        assert!(running.attempts[0].outcome.starts_with("exited early"));
        assert_eq!(running.attempts[1].outcome, "missing");
        running.child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn validation_skips_rejected_configs() {
        let fx = Fixture::new();
        let bad = fx.config("full.json5", "{ bad: true }");
        let good = fx.config("web.json5", "{ mode: 'router' }");
        let options = StartOptions {
            validate_first: true,
            force: true,
        };
        let mut running = fx
            .runner
            .launch_with_fallback(&[bad, good.clone()], options)
            .await
            .unwrap();
        assert_eq!(running.config, Some(good));
        assert!(running.attempts[0].outcome.starts_with("rejected (exit 3)"));
        running.child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn runs_bare_when_every_config_fails() {
        let fx = Fixture::new();
        let bad = fx.config("full.json5", "{ bad: true }");
        let options = StartOptions {
            validate_first: false,
            force: true,
        };
        let mut running = fx
            .runner
            .launch_with_fallback(&[bad], options)
            .await
            .unwrap();
        assert!(running.config.is_none());
        assert_eq!(running.attempts.len(), 1);
        running.child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn waits_for_router_exit() {
        let fx = Fixture::new();
        let mut running = fx
            .runner
            .launch_with_fallback(
                &[],
                StartOptions {
                    validate_first: false,
                    force: true,
                },
            )
            .await
            .unwrap();
        running.child.start_kill().unwrap();
        let status = wait_foreground(running).await.unwrap();
        assert!(!status.success());
    }

    #[test]
    fn truncates_long_process_names() {
        assert_eq!(truncated(OsStr::new("zenohd")), "zenohd");
        assert_eq!(
            truncated(OsStr::new("a-very-long-router-name")),
            "a-very-long-rou"
        );
        assert_eq!(join_pids(&[12, 7]), "12, 7");
    }
}
