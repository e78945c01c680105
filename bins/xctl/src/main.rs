use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use xctl_automation::{AutomationSession, Destination};
use xctl_common::Udid;
use xctl_companion::proto::{xctest_run_request, XctestRunRequest};
use xctl_companion::config::parse_duration;
use xctl_companion::{BinaryLocator, CompanionConfig, CompanionOptions};

/// xctl - iOS device and simulator automation over idb_companion
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Target device or simulator UDID (overrides config)
    #[arg(short, long, global = true)]
    udid: Option<String>,

    /// Companion binary path (overrides config and IDB_COMPANION_PATH)
    #[arg(long, value_name = "PATH", global = true)]
    binary: Option<PathBuf>,

    /// gRPC port requested from the companion (0 = any)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Per-call deadline, e.g. "30s" or "2m" (overrides config)
    #[arg(long, value_parser = parse_duration, global = true)]
    timeout: Option<Duration>,

    /// Run the companion with debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved companion binary path
    Locate,

    #[command(flatten)]
    Session(SessionCommand),
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// Describe the target
    Describe,

    /// List installed apps
    #[command(alias = "ls")]
    ListApps,

    /// Save a screenshot
    Screenshot {
        /// Output file (PNG)
        output: PathBuf,
    },

    /// Stream target logs until interrupted
    Logs {
        /// Arguments passed through to the log command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },

    /// Copy a local file into an app container
    Push {
        /// Local file
        source: PathBuf,

        /// Destination path inside the container
        destination: String,

        /// Bundle ID of the owning app
        #[arg(long)]
        bundle_id: String,
    },

    /// Install an app bundle or other artifact
    Install {
        /// Artifact to install (.ipa, .app archive, .xctest, ...)
        artifact: PathBuf,

        /// Kind of artifact
        #[arg(long, value_enum, default_value_t = ArtifactKind::App)]
        kind: ArtifactKind,
    },

    /// Copy a file out of an app container
    Pull {
        /// Source path inside the container
        source: String,

        /// Local output file
        output: PathBuf,

        /// Bundle ID of the owning app
        #[arg(long)]
        bundle_id: String,
    },

    /// Launch an installed app
    Launch {
        bundle_id: String,

        /// Arguments passed to the app
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },

    /// Tap the screen at a point
    Tap {
        x: f64,
        y: f64,
    },

    /// Run an installed test bundle and report results as they finish
    Xctest {
        /// Bundle ID of the test bundle
        test_bundle_id: String,

        /// App under test (application or UI tests)
        #[arg(long)]
        app: Option<String>,

        /// Test host app (UI tests)
        #[arg(long, requires = "app")]
        test_host: Option<String>,
    },

    /// Terminate a running app
    Terminate {
        bundle_id: String,
    },

    /// Uninstall an app
    Uninstall {
        bundle_id: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ArtifactKind {
    App,
    Xctest,
    Dylib,
    Dsym,
    Framework,
}

impl From<ArtifactKind> for Destination {
    fn from(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::App => Destination::App,
            ArtifactKind::Xctest => Destination::Xctest,
            ArtifactKind::Dylib => Destination::Dylib,
            ArtifactKind::Dsym => Destination::Dsym,
            ArtifactKind::Framework => Destination::Framework,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    initialize_logging(args.debug)?;

    let options = load_options(&args)?;

    match args.command {
        Command::Locate => locate(&options),
        Command::Session(command) => run_session(options, command).await,
    }
}

fn initialize_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Config file first, then command-line overrides.
fn load_options(args: &Args) -> Result<CompanionOptions> {
    let mut options = match &args.config {
        Some(path) => {
            info!("Config file: {}", path.display());
            CompanionConfig::load_from_file(path)?.companion
        }
        None => CompanionOptions::default(),
    };

    if let Some(udid) = &args.udid {
        options.target = Some(Udid::from(udid.as_str()));
    }
    if let Some(binary) = &args.binary {
        options.binary_path = Some(binary.clone());
    }
    if let Some(port) = args.port {
        options.requested_port = port;
    }
    if let Some(timeout) = args.timeout {
        options.operation_timeout = timeout;
    }
    if args.verbose {
        options.verbose = true;
    }

    options.validate().context("Invalid companion options")?;
    Ok(options)
}

fn locate(options: &CompanionOptions) -> Result<()> {
    let path = BinaryLocator::from_options(options).locate()?;
    println!("{}", path.display());
    Ok(())
}

async fn run_session(options: CompanionOptions, command: SessionCommand) -> Result<()> {
    let mut session =
        AutomationSession::new(options).context("A target UDID is required (--udid or config)")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    let result = execute(&mut session, command, &cancel).await;

    info!("Shutting down companion...");
    session.shutdown().await;
    result
}

async fn execute(
    session: &mut AutomationSession,
    command: SessionCommand,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        SessionCommand::Describe => {
            let response = session.describe(cancel).await?;
            let target = response.target_description.unwrap_or_default();
            println!("udid:         {}", target.udid);
            println!("name:         {}", target.name);
            println!("state:        {}", target.state);
            println!("type:         {}", target.target_type);
            println!("os_version:   {}", target.os_version);
            println!("architecture: {}", target.architecture);
        }
        SessionCommand::ListApps => {
            for app in session.list_apps(cancel).await? {
                println!("{} | {} | {}", app.bundle_id, app.name, app.install_type);
            }
        }
        SessionCommand::Screenshot { output } => {
            let image = session.screenshot(cancel).await?;
            tokio::fs::write(&output, &image)
                .await
                .with_context(|| format!("Failed to write screenshot to {}", output.display()))?;
            info!("✅ Saved {} bytes to {}", image.len(), output.display());
        }
        SessionCommand::Logs { arguments } => {
            let mut tail = session.tail_logs(arguments, cancel).await?;
            let mut stdout = tokio::io::stdout();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    chunk = tail.next_chunk() => chunk?,
                };
                match chunk {
                    Some(bytes) => {
                        stdout.write_all(&bytes).await?;
                        stdout.flush().await?;
                    }
                    None => break,
                }
            }
            info!("Log stream ended after {} bytes", tail.received());
        }
        SessionCommand::Push {
            source,
            destination,
            bundle_id,
        } => {
            let sent = session
                .push_file(&source, &bundle_id, &destination, cancel)
                .await?;
            info!("✅ Pushed {} bytes to {}:{}", sent, bundle_id, destination);
        }
        SessionCommand::Install { artifact, kind } => {
            let installed = session
                .install(&artifact, kind.into(), cancel, |progress| {
                    info!(progress, "Installing");
                })
                .await?;
            println!("{} {}", installed.name, installed.uuid);
        }
        SessionCommand::Pull {
            source,
            output,
            bundle_id,
        } => {
            let data = session.pull_file(&bundle_id, &source, cancel).await?;
            tokio::fs::write(&output, &data)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("✅ Pulled {} bytes to {}", data.len(), output.display());
        }
        SessionCommand::Launch {
            bundle_id,
            arguments,
        } => {
            let pid = session
                .launch(&bundle_id, arguments, Default::default(), cancel)
                .await?;
            println!("{}", pid);
        }
        SessionCommand::Tap { x, y } => {
            session.tap(x, y, cancel).await?;
        }
        SessionCommand::Xctest {
            test_bundle_id,
            app,
            test_host,
        } => {
            let mode = match (app, test_host) {
                (Some(app_bundle_id), Some(test_host_app_bundle_id)) => {
                    xctest_run_request::Mode::Ui(xctest_run_request::Ui {
                        app_bundle_id,
                        test_host_app_bundle_id,
                    })
                }
                (Some(app_bundle_id), None) => {
                    xctest_run_request::Mode::Application(xctest_run_request::Application {
                        app_bundle_id,
                    })
                }
                _ => xctest_run_request::Mode::Logic(xctest_run_request::Logic {}),
            };
            let request = XctestRunRequest {
                mode: Some(mode),
                test_bundle_id,
                ..Default::default()
            };

            let mut run = session.run_xctest(request, cancel).await?;
            loop {
                let update = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    update = run.next_update() => update?,
                };
                let Some(update) = update else { break };
                for result in &update.results {
                    let outcome = if result.passed { "PASS" } else { "FAIL" };
                    println!(
                        "{} {}/{} ({:.3}s)",
                        outcome, result.class_name, result.method_name, result.duration
                    );
                }
            }
            info!("{} results, {} failed", run.results(), run.failures());
            if run.failures() > 0 {
                anyhow::bail!("{} test(s) failed", run.failures());
            }
        }
        SessionCommand::Terminate { bundle_id } => {
            session.terminate(&bundle_id, cancel).await?;
            info!("Terminated {}", bundle_id);
        }
        SessionCommand::Uninstall { bundle_id } => {
            session.uninstall(&bundle_id, cancel).await?;
            info!("Uninstalled {}", bundle_id);
        }
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers: {}", e);
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C signal");
    }
}
