use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::engine::state::ProvisionState;

/// Print a user-facing status line.
pub fn step(icon: &str, message: impl AsRef<str>) {
    println!("{icon} {}", message.as_ref());
}

pub fn ok(message: impl AsRef<str>) {
    step("✅", message);
}

pub fn warn(message: impl AsRef<str>) {
    step("⚠️ ", message);
}

pub fn fail(message: impl AsRef<str>) {
    eprintln!("❌ {}", message.as_ref());
}

/// One line per state, as printed by the console renderer.
pub fn describe(state: &ProvisionState) -> Option<(&'static str, String)> {
    let line = match state {
        ProvisionState::Idle | ProvisionState::Fetching { .. } => return None,
        ProvisionState::Extracting { file } => ("📂", format!("Extracting {file}")),
        ProvisionState::Installing { packages } => {
            ("📦", format!("Installing {packages} package(s)"))
        }
        ProvisionState::Verifying => ("🔍", "Verifying router version".to_owned()),
        ProvisionState::Configuring => ("📝", "Writing configuration presets".to_owned()),
        ProvisionState::Validating { preset } => {
            ("🧪", format!("Validating preset '{preset}' (--dry-run)"))
        }
        ProvisionState::Rejected { preset, reason } => {
            ("⚠️ ", format!("Preset '{preset}' {reason}"))
        }
        ProvisionState::Ready { version, preset } => (
            "✅",
            match preset {
                Some(preset) => format!("Router {version} ready with preset '{preset}'"),
                None => format!("Router {version} ready (no preset accepted; built-in defaults)"),
            },
        ),
        ProvisionState::Error(err) => ("❌", err.clone()),
    };
    Some(line)
}

fn download_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template("⬇️  {msg:30} [{bar:30}] {pos:>3}% {prefix}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(200));
    bar
}

/// Render pipeline states until the sender side is dropped.
pub async fn render(mut updates: mpsc::UnboundedReceiver<ProvisionState>) {
    let mut bar: Option<(String, ProgressBar)> = None;

    while let Some(state) = updates.recv().await {
        if let ProvisionState::Fetching {
            file,
            progress,
            speed,
        } = &state
        {
            let same_file = bar.as_ref().is_some_and(|(current, _)| current == file);
            if !same_file {
                if let Some((_, old)) = bar.take() {
                    old.finish_and_clear();
                }
                let fresh = download_bar();
                fresh.set_message(file.clone());
                bar = Some((file.clone(), fresh));
            }
            if let Some((_, active)) = &bar {
                active.set_position(progress.clamp(0.0, 100.0) as u64);
                active.set_prefix(speed.clone());
            }
            continue;
        }

        if let Some((file, active)) = bar.take() {
            active.finish_and_clear();
            ok(format!("Downloaded {file}"));
        }
        if matches!(state, ProvisionState::Error(_)) {
            // The caller reports the error itself.
            break;
        }
        if let Some((icon, line)) = describe(&state) {
            step(icon, line);
        }
        if state.is_terminal() {
            break;
        }
    }

    if let Some((_, active)) = bar {
        active.finish_and_clear();
    }
}
