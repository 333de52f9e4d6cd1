use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{debug, info, warn};
use tokio::sync::mpsc;

mod diagnostics;
mod engine;
mod env;
mod packages;
mod presets;
mod publish;
mod router;
mod settings;
mod smoke;
mod storage;
mod ui;
mod util;
mod version;
mod viewer;

use crate::diagnostics::Diagnostics;
use crate::engine::{ProvisionEngine, ProvisionOptions};
use crate::packages::{InstallOptions, PackageInstaller, apt};
use crate::presets::Preset;
use crate::publish::{FrameSource, PublishKeys, PublishOptions, Publisher};
use crate::router::{RouterRunner, StartOptions};
use crate::settings::Settings;
use crate::smoke::SmokeRunner;
use crate::storage::StorageManager;

#[derive(Parser, Debug)]
#[command(
    name = "zenohd-setup",
    author,
    version,
    about = "Install, configure, start and smoke-test a zenohd router"
)]
struct Cli {
    /// Router executable to run.
    #[arg(long, global = true)]
    binary: Option<String>,
    /// Directory holding the generated `<preset>.json5` files.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Settings file to read instead of `<app_dir>/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[arg(long, global = true)]
    rest_url: Option<String>,
    #[arg(long, global = true)]
    webserver_url: Option<String>,
    /// Router mode written into configs (router, peer or client).
    #[arg(short, long, global = true)]
    mode: Option<String>,
    /// Listen endpoint; repeat for several.
    #[arg(short, long = "listen", global = true)]
    listen: Vec<String>,
    /// Endpoint to connect to; repeat for several.
    #[arg(short = 'e', long = "connect", global = true)]
    connect: Vec<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Copy)]
struct InstallArgs {
    /// Fail when a package manager command fails.
    #[arg(long)]
    strict: bool,
    /// Print the package manager commands instead of running them.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    no_sudo: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the release archives and install the router packages.
    Install(InstallArgs),
    /// List the configuration presets.
    Presets,
    /// Write the preset configuration files.
    Configure {
        #[arg(short, long = "preset")]
        presets: Vec<String>,
        /// Print the rendered configs instead of writing them.
        #[arg(long)]
        stdout: bool,
    },
    /// Dry-run each preset configuration against the router.
    Validate {
        #[arg(short, long = "preset")]
        presets: Vec<String>,
    },
    /// Start the router, falling back through the presets.
    Start {
        #[arg(short, long = "preset")]
        presets: Vec<String>,
        /// Skip candidates the router rejects in a dry run.
        #[arg(long)]
        validate: bool,
        /// Start even if a router is already running.
        #[arg(long)]
        force: bool,
        /// Seconds to wait before checking the router is still alive.
        #[arg(long)]
        liveness_delay: Option<u64>,
    },
    /// Check the REST and webserver endpoints of a running router.
    Smoke {
        #[arg(long)]
        json: bool,
    },
    /// Write the image viewer page.
    Viewer {
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Open the page in the default browser.
        #[arg(long)]
        open: bool,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Put image frames to the router's REST API on a fixed interval.
    Publish {
        /// Image file, or directory of images cycled in name order.
        #[arg(long)]
        rgb: PathBuf,
        #[arg(long)]
        depth: Option<PathBuf>,
        /// Key prefix; frames go to `<key>/rgb` and `<key>/depth`.
        #[arg(short, long)]
        key: Option<String>,
        #[arg(long, default_value_t = 33)]
        interval_ms: u64,
        /// Stop after this many frames.
        #[arg(long)]
        count: Option<u64>,
    },
    /// Report on the installation and the running router.
    Doctor {
        /// Also write the report under the logs directory.
        #[arg(long)]
        save: bool,
        #[arg(long)]
        no_smoke: bool,
        #[arg(long)]
        json: bool,
    },
    /// Install, configure and validate in one go.
    Provision {
        #[command(flatten)]
        install: InstallArgs,
        #[arg(long)]
        skip_install: bool,
        /// Start the router with the first accepted preset.
        #[arg(long)]
        start: bool,
        #[arg(long)]
        force: bool,
    },
    /// Show what is installed, configured and running.
    Status,
    /// Remove downloads, staging files, generated configs and the install record.
    Clean,
    /// Remove the router packages.
    Uninstall(InstallArgs),
}

struct Context {
    settings: Settings,
    storage: StorageManager,
    config_dir: PathBuf,
}

impl Context {
    fn from_cli(cli: &Cli) -> Result<Self, String> {
        let mut settings = match &cli.settings {
            Some(path) => Settings::load_required(path)?,
            None => Settings::load()?,
        };
        if let Some(binary) = &cli.binary {
            settings.router.binary = binary.clone();
        }
        if let Some(mode) = &cli.mode {
            settings.router.mode = mode.clone();
        }
        if !cli.listen.is_empty() {
            settings.router.listen_endpoints = cli.listen.clone();
        }
        if !cli.connect.is_empty() {
            settings.router.connect_endpoints = cli.connect.clone();
        }
        if let Some(url) = &cli.rest_url {
            settings.smoke.rest_url = url.clone();
        }
        if let Some(url) = &cli.webserver_url {
            settings.smoke.webserver_url = url.clone();
        }

        let storage = StorageManager::new();
        let config_dir = cli
            .config_dir
            .clone()
            .unwrap_or_else(|| storage.config_dir());
        debug!("cli: settings {:?}", settings);
        Ok(Self {
            settings,
            storage,
            config_dir,
        })
    }

    /// Named presets, or the configured fallback order when none are given.
    fn presets(&self, names: &[String]) -> Result<Vec<Preset>, String> {
        if names.is_empty() {
            Preset::resolve(&self.settings.router.presets)
        } else {
            Preset::resolve(names)
        }
    }

    fn candidates(&self, names: &[String]) -> Result<Vec<PathBuf>, String> {
        let list = self.presets(names)?;
        presets::ensure_written(&self.config_dir, &list, &self.settings.router)
    }

    async fn install_options(&self, args: InstallArgs) -> InstallOptions {
        let sudo = self.settings.install.use_sudo && !args.no_sudo && !apt::running_as_root().await;
        InstallOptions {
            strict: args.strict,
            dry_run: args.dry_run,
            sudo,
        }
    }

    fn engine(&self, cancel: Arc<AtomicBool>) -> ProvisionEngine {
        ProvisionEngine::new(
            self.settings.clone(),
            self.storage.clone(),
            self.config_dir.clone(),
            cancel,
        )
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            ui::fail(err);
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let ctx = Context::from_cli(&cli)?;
    match cli.command {
        Command::Install(args) => install(&ctx, args).await,
        Command::Presets => {
            list_presets(&ctx);
            Ok(())
        }
        Command::Configure { presets, stdout } => configure(&ctx, &presets, stdout),
        Command::Validate { presets } => validate(&ctx, &presets).await,
        Command::Start {
            presets,
            validate,
            force,
            liveness_delay,
        } => {
            let mut runner = RouterRunner::from_settings(&ctx.settings.router);
            if let Some(secs) = liveness_delay {
                runner = RouterRunner::new(
                    runner.binary(),
                    Duration::from_secs(secs),
                    Duration::from_secs(ctx.settings.router.validate_timeout_secs),
                );
            }
            let candidates = ctx.candidates(&presets)?;
            start(
                &runner,
                &candidates,
                StartOptions {
                    validate_first: validate,
                    force,
                },
            )
            .await
        }
        Command::Smoke { json } => run_smoke(&ctx, json).await,
        Command::Viewer {
            out,
            open,
            interval_ms,
        } => write_viewer(&ctx, out, open, interval_ms),
        Command::Publish {
            rgb,
            depth,
            key,
            interval_ms,
            count,
        } => {
            let options = PublishOptions {
                interval: Duration::from_millis(interval_ms),
                count,
                ..Default::default()
            };
            publish(&ctx, &rgb, depth.as_deref(), key.as_deref(), options).await
        }
        Command::Doctor {
            save,
            no_smoke,
            json,
        } => doctor(ctx, save, !no_smoke, json).await,
        Command::Provision {
            install,
            skip_install,
            start,
            force,
        } => provision(&ctx, install, skip_install, start, force).await,
        Command::Status => status(&ctx).await,
        Command::Clean => {
            let removed = ctx.storage.clean().await?;
            if removed.is_empty() {
                ui::ok("Nothing to clean");
            }
            for path in removed {
                ui::step("🗑️ ", format!("Removed {}", path.display()));
            }
            Ok(())
        }
        Command::Uninstall(args) => uninstall(&ctx, args).await,
    }
}

/// Flag flipped by Ctrl-C; downloads, installs and publishing stop at their next check.
fn cancel_on_interrupt() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cli: interrupt received, cancelling");
            handle.store(true, Ordering::SeqCst);
        }
    });
    flag
}

async fn install(ctx: &Context, args: InstallArgs) -> Result<(), String> {
    let options = ctx.install_options(args).await;
    let mut engine = ctx.engine(cancel_on_interrupt());

    let (tx, rx) = mpsc::unbounded_channel();
    let console = tokio::spawn(ui::render(rx));
    let result = engine.install(options, &tx).await;
    drop(tx);
    let _ = console.await;
    debug!("cli: engine finished in state {:?}", engine.state);

    match result? {
        Some(record) => ui::ok(format!(
            "Installed {} ({})",
            record.version,
            record.packages.join(", ")
        )),
        None => ui::ok("Dry run complete; nothing was installed"),
    }
    Ok(())
}

fn list_presets(ctx: &Context) {
    let order = &ctx.settings.router.presets;
    for preset in Preset::all() {
        let position = order.iter().position(|name| name == preset.name);
        let plugins = preset.plugins();
        println!(
            "{:<8} {:<5} {:<45} plugins: {}",
            preset.name,
            position.map_or_else(|| "-".to_owned(), |index| format!("#{}", index + 1)),
            preset.summary,
            if plugins.is_empty() {
                "none".to_owned()
            } else {
                plugins.join(", ")
            }
        );
    }
}

fn configure(ctx: &Context, names: &[String], stdout: bool) -> Result<(), String> {
    let list = ctx.presets(names)?;
    if stdout {
        for preset in &list {
            let value = presets::render(preset, &ctx.settings.router);
            print!("{}", presets::to_json5(&value, preset)?);
        }
        return Ok(());
    }

    for path in presets::write_all(&ctx.config_dir, &list, &ctx.settings.router)? {
        ui::step("📝", format!("Wrote {}", path.display()));
    }
    Ok(())
}

async fn validate(ctx: &Context, names: &[String]) -> Result<(), String> {
    let candidates = ctx.candidates(names)?;
    let runner = RouterRunner::from_settings(&ctx.settings.router);
    let results = runner.validate_all(&candidates).await?;

    let mut accepted = 0;
    for (config, validation) in &results {
        if validation.is_accepted() {
            accepted += 1;
            ui::ok(format!("{} accepted", config.display()));
        } else {
            ui::step("❌", format!("{} {validation}", config.display()));
        }
    }
    if accepted == 0 {
        return Err(format!(
            "{} accepted none of {} configuration(s)",
            runner.binary().display(),
            results.len()
        ));
    }
    Ok(())
}

async fn start(
    runner: &RouterRunner,
    candidates: &[PathBuf],
    options: StartOptions,
) -> Result<(), String> {
    let running = runner.launch_with_fallback(candidates, options).await?;
    for attempt in &running.attempts {
        ui::warn(format!("{}: {}", attempt.config.display(), attempt.outcome));
    }
    match &running.config {
        Some(config) => ui::ok(format!("Router running with {}", config.display())),
        None => ui::warn("Router running with built-in defaults"),
    }
    ui::step("ℹ️ ", "Press Ctrl-C to stop");

    let status = router::wait_foreground(running).await?;
    info!("router exited with {status}");
    ui::step("🛑", format!("Router stopped ({status})"));
    Ok(())
}

async fn run_smoke(ctx: &Context, json: bool) -> Result<(), String> {
    let runner = SmokeRunner::new(&ctx.settings.smoke);
    let report = runner
        .run(&smoke::default_checks(&ctx.settings.viewer))
        .await;
    if json {
        let body = serde_json::to_string_pretty(&report)
            .map_err(|e| format!("unable to encode smoke report: {e}"))?;
        println!("{body}");
    } else {
        print!("{}", smoke::format_report(&report));
    }
    if report.success() {
        Ok(())
    } else {
        Err("required smoke checks failed".into())
    }
}

fn write_viewer(
    ctx: &Context,
    out: Option<PathBuf>,
    open_page: bool,
    interval_ms: Option<u64>,
) -> Result<(), String> {
    let mut viewer_settings = ctx.settings.viewer.clone();
    if let Some(interval) = interval_ms {
        viewer_settings.poll_interval_ms = interval;
    }
    let html = viewer::render(&viewer_settings, &ctx.settings.smoke);
    let path = out.unwrap_or_else(|| ctx.storage.viewer_page());
    viewer::write(&path, &html)?;
    ui::ok(format!("Viewer written to {}", path.display()));

    if open_page {
        open::that(&path).map_err(|e| format!("failed to open {}: {e}", path.display()))?;
    }
    Ok(())
}

async fn publish(
    ctx: &Context,
    rgb: &Path,
    depth: Option<&Path>,
    key: Option<&str>,
    options: PublishOptions,
) -> Result<(), String> {
    let mut rgb = FrameSource::open(rgb)?;
    let mut depth = depth.map(FrameSource::open).transpose()?;
    let keys = PublishKeys::new(&ctx.settings.viewer, key);
    ui::step("📡", format!("Publishing to {} (Ctrl-C to stop)", keys.rgb));

    let publisher = Publisher::new(&ctx.settings.smoke, keys);
    let cancel = Some(cancel_on_interrupt());
    let summary = publisher
        .run(&mut rgb, depth.as_mut(), options, &cancel)
        .await?;
    if summary.failures == 0 {
        ui::ok(format!("Published {} frame(s)", summary.frames));
        Ok(())
    } else {
        Err(format!(
            "{} of {} frame(s) failed to publish",
            summary.failures, summary.frames
        ))
    }
}

async fn doctor(ctx: Context, save: bool, with_smoke: bool, json: bool) -> Result<(), String> {
    let checker = Diagnostics::new(ctx.settings, ctx.storage).with_config_dir(ctx.config_dir);
    let report = checker.run(with_smoke).await;
    if json {
        let body = serde_json::to_string_pretty(&report)
            .map_err(|e| format!("unable to encode report: {e}"))?;
        println!("{body}");
    } else {
        print!("{}", diagnostics::format_report(&report));
    }
    if save {
        let path = checker.save_report(&report)?;
        ui::ok(format!("Report saved to {}", path.display()));
    }
    Ok(())
}

async fn provision(
    ctx: &Context,
    args: InstallArgs,
    skip_install: bool,
    start_router: bool,
    force: bool,
) -> Result<(), String> {
    let options = ProvisionOptions {
        install: ctx.install_options(args).await,
        skip_install,
    };
    let mut engine = ctx.engine(cancel_on_interrupt());

    let (tx, rx) = mpsc::unbounded_channel();
    let console = tokio::spawn(ui::render(rx));
    let result = engine.provision(options, &tx).await;
    drop(tx);
    let _ = console.await;
    debug!("cli: engine finished in state {:?}", engine.state);
    let outcome = result?;

    if !start_router {
        return Ok(());
    }
    if args.dry_run {
        ui::warn("Dry run; not starting the router");
        return Ok(());
    }

    // Begin the fallback chain at the accepted preset; none accepted means a bare run.
    let candidates: Vec<PathBuf> = match &outcome.preset {
        Some(name) => {
            let file = format!("{name}.{}", presets::CONFIG_EXTENSION);
            outcome
                .configs
                .iter()
                .skip_while(|path| !path.ends_with(&file))
                .cloned()
                .collect()
        }
        None => Vec::new(),
    };
    let runner = RouterRunner::from_settings(&ctx.settings.router);
    start(
        &runner,
        &candidates,
        StartOptions {
            validate_first: false,
            force,
        },
    )
    .await
}

async fn status(ctx: &Context) -> Result<(), String> {
    match ctx.storage.read_install_record().await {
        Some(record) => ui::ok(format!(
            "Installed {} at {} ({})",
            record.version,
            record.installed_at,
            record.packages.join(", ")
        )),
        None => ui::warn("No install recorded"),
    }

    let list = ctx.presets(&[])?;
    for preset in &list {
        let path = ctx.config_dir.join(preset.file_name());
        if path.exists() {
            ui::step("📄", format!("{}: {}", preset.name, path.display()));
        } else {
            ui::step("➖", format!("{}: not written", preset.name));
        }
    }

    let binary = PathBuf::from(&ctx.settings.router.binary);
    let pids = router::running_routers(&binary);
    if pids.is_empty() {
        ui::step("⏹️ ", "Router not running");
    } else {
        ui::ok(format!("Router running (pid {})", router::join_pids(&pids)));
    }
    Ok(())
}

async fn uninstall(ctx: &Context, args: InstallArgs) -> Result<(), String> {
    let options = ctx.install_options(args).await;
    let installer = PackageInstaller::new(ctx.settings.release.clone(), &ctx.storage);
    installer.uninstall(options).await?;
    if options.dry_run {
        return Ok(());
    }
    ctx.storage.forget_install_record().await?;
    ui::ok("Router packages removed");
    Ok(())
}
