use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use log::{debug, info, warn};
use tokio::process::Command;

use crate::util::{CANCELLED, cancel_requested};

/// A package-manager invocation, kept as data so `--dry-run` can print it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PlannedCommand {
    fn new(sudo: bool, program: &str, args: Vec<String>) -> Self {
        if sudo {
            let mut full = vec![program.to_owned()];
            full.extend(args);
            Self {
                program: "sudo".into(),
                args: full,
            }
        } else {
            Self {
                program: program.into(),
                args,
            }
        }
    }

    pub async fn run(&self) -> Result<(), String> {
        info!("apt: running {self}");
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.program))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("`{self}` exited with {status}"))
        }
    }
}

impl fmt::Display for PlannedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub strict: bool,
    pub dry_run: bool,
    pub sudo: bool,
}

fn local_path(deb: &Path) -> String {
    // apt treats bare names as repository packages; local files need a path prefix.
    if deb.is_absolute() || deb.starts_with(".") {
        deb.display().to_string()
    } else {
        format!("./{}", deb.display())
    }
}

pub fn apt_install_command(debs: &[PathBuf], sudo: bool) -> PlannedCommand {
    let mut args = vec!["install".to_owned(), "-y".to_owned()];
    args.extend(debs.iter().map(|deb| local_path(deb)));
    PlannedCommand::new(sudo, "apt-get", args)
}

pub fn dpkg_install_commands(debs: &[PathBuf], sudo: bool) -> Vec<PlannedCommand> {
    debs.iter()
        .map(|deb| PlannedCommand::new(sudo, "dpkg", vec!["-i".into(), local_path(deb)]))
        .collect()
}

pub fn apt_remove_command(packages: &[String], sudo: bool) -> PlannedCommand {
    let mut args = vec!["remove".to_owned(), "-y".to_owned()];
    args.extend(packages.iter().cloned());
    PlannedCommand::new(sudo, "apt-get", args)
}

/// Install local debs with apt, falling back to `dpkg -i` per file.
///
/// Failures only become errors in strict mode; otherwise they are logged and
/// the caller's version check decides whether the install worked. The cancel
/// flag is checked before every command.
pub async fn install_debs(
    debs: &[PathBuf],
    options: InstallOptions,
    cancel: &Option<Arc<AtomicBool>>,
) -> Result<(), String> {
    let apt = apt_install_command(debs, options.sudo);
    if options.dry_run {
        println!("{apt}");
        for cmd in dpkg_install_commands(debs, options.sudo) {
            println!("# fallback: {cmd}");
        }
        return Ok(());
    }

    if cancel_requested(cancel) {
        return Err(CANCELLED.into());
    }
    let apt_err = match apt.run().await {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    warn!("apt: {apt_err}; falling back to dpkg");

    let mut failures = Vec::new();
    for cmd in dpkg_install_commands(debs, options.sudo) {
        if cancel_requested(cancel) {
            return Err(CANCELLED.into());
        }
        if let Err(err) = cmd.run().await {
            warn!("apt: {err}");
            failures.push(err);
        }
    }

    if failures.is_empty() {
        debug!("apt: dpkg fallback installed {} package(s)", debs.len());
        Ok(())
    } else if options.strict {
        Err(failures.join("; "))
    } else {
        warn!(
            "apt: ignoring {} failed install command(s) (use --strict to fail)",
            failures.len()
        );
        Ok(())
    }
}

pub async fn remove_packages(packages: &[String], options: InstallOptions) -> Result<(), String> {
    let cmd = apt_remove_command(packages, options.sudo);
    if options.dry_run {
        println!("{cmd}");
        return Ok(());
    }
    match cmd.run().await {
        Ok(()) => Ok(()),
        Err(err) if options.strict => Err(err),
        Err(err) => {
            warn!("apt: {err}");
            Ok(())
        }
    }
}

/// True when running as uid 0, where `sudo` is unnecessary.
pub async fn running_as_root() -> bool {
    match Command::new("id").arg("-u").output().await {
        Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "0",
        Err(err) => {
            debug!("apt: unable to run id -u ({err})");
            false
        }
    }
}
