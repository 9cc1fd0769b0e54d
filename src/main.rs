use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tabled::settings::Style;
use tabled::Tabled;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use caddy_atc::paths::Paths;
use caddy_atc::routes::ActiveRoute;
use caddy_atc::store::Registry;
use caddy_atc::watcher::Watcher;
use caddy_atc::{adopt, docker, gateway, pidfile, start};

#[derive(Parser)]
#[command(
    name = "caddy-atc",
    version,
    about = "Local development gateway - route projects by hostname",
    long_about = "caddy-atc eliminates Docker port conflicts by routing HTTP traffic \
                  through a single Caddy gateway using hostname-based routing \
                  (project.localhost)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the caddy-atc gateway and watcher
    Up,
    /// Stop the caddy-atc gateway
    Down,
    /// Register a project for automatic routing
    Adopt {
        /// Project directory (defaults to the current directory)
        directory: Option<PathBuf>,
        /// Override base hostname (default: <dirname>.localhost)
        #[arg(long, default_value = "")]
        hostname: String,
        /// Preview without saving
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove a project from automatic routing
    Unadopt {
        /// Project directory (defaults to the current directory)
        directory: Option<PathBuf>,
    },
    /// Show gateway health and active routes
    Status,
    /// List all active routes
    Routes,
    /// Install Caddy's root CA in system trust store
    Trust,
    /// Start a project with host ports stripped
    Start {
        /// Project directory (defaults to the current directory)
        directory: Option<PathBuf>,
        /// Service names whose host ports should be kept
        #[arg(long, value_delimiter = ',')]
        keep_ports: Vec<String>,
        /// Command to run instead of `docker compose up -d`
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Stop a project started with `caddy-atc start`
    Stop {
        /// Project directory (defaults to the current directory)
        directory: Option<PathBuf>,
    },
    /// Show watcher logs
    Logs {
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let paths = Paths::resolve();

    if let Err(e) = init_logging(&paths, matches!(&cli.command, Commands::Up)) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli, &paths).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Log to stderr; the watcher (`up`) additionally appends to watcher.log.
fn init_logging(paths: &Paths, with_log_file: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("caddy_atc=info".parse().expect("valid log directive"));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file_layer = if with_log_file {
        paths.ensure_dirs()?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.log_path())
            .with_context(|| format!("opening log file {}", paths.log_path().display()))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

async fn run(cli: Cli, paths: &Paths) -> anyhow::Result<()> {
    match cli.command {
        Commands::Up => cmd_up(paths).await,
        Commands::Down => cmd_down(paths).await,
        Commands::Adopt {
            directory,
            hostname,
            dry_run,
        } => cmd_adopt(paths, directory.unwrap_or_else(|| ".".into()), &hostname, dry_run),
        Commands::Unadopt { directory } => {
            adopt::unadopt(paths, &directory.unwrap_or_else(|| ".".into()))?;
            println!("Project removed from caddy-atc.");
            Ok(())
        }
        Commands::Status => cmd_status(paths).await,
        Commands::Routes => cmd_routes(paths).await,
        Commands::Trust => {
            let client = docker::connect().await?;
            gateway::trust(paths, &client).await
        }
        Commands::Start {
            directory,
            keep_ports,
            command,
        } => {
            start::run(
                paths,
                start::Options {
                    dir: directory.unwrap_or_else(|| ".".into()),
                    keep_ports,
                    command,
                },
            )
            .await
        }
        Commands::Stop { directory } => start::stop(&directory.unwrap_or_else(|| ".".into())).await,
        Commands::Logs { follow } => cmd_logs(paths, follow).await,
    }
}

async fn cmd_up(paths: &Paths) -> anyhow::Result<()> {
    println!("Starting caddy-atc gateway...");
    gateway::up(paths).await?;

    println!("Starting watcher (press Ctrl+C to stop)...");
    run_watcher(paths).await
}

async fn run_watcher(paths: &Paths) -> anyhow::Result<()> {
    paths.ensure_dirs()?;

    if pidfile::is_watcher_running(paths) {
        anyhow::bail!("a watcher is already running (see {})", paths.pid_path().display());
    }
    pidfile::write(paths)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let client = docker::connect().await?;
    let watcher = Watcher::new(client, paths.clone(), shutdown_rx);
    let result = watcher.run().await;

    pidfile::remove(paths);
    result
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn cmd_down(paths: &Paths) -> anyhow::Result<()> {
    pidfile::stop_watcher(paths);
    gateway::down(paths).await
}

fn cmd_adopt(paths: &Paths, dir: PathBuf, hostname: &str, dry_run: bool) -> anyhow::Result<()> {
    println!("Scanning docker-compose.yml...");
    println!();

    let result = adopt::adopt(paths, &dir, hostname, dry_run)?;

    let primary = adopt::find_primary(&result.http_services);
    println!("Detected HTTP services:");
    for (i, svc) in result.http_services.iter().enumerate() {
        let hostname = if i == primary {
            result.hostname.clone()
        } else {
            format!("{}.{}", svc.name, result.hostname)
        };
        println!("  {:<12} (port {:<5}) -> {}", svc.name, svc.port, hostname);
    }

    if !result.skipped_services.is_empty() {
        println!();
        println!("Skipped (non-HTTP):");
        for svc in &result.skipped_services {
            let ports = if svc.ports.is_empty() {
                "no ports".to_string()
            } else {
                svc.ports.join(", ")
            };
            println!("  {:<12} ({})", svc.name, ports);
        }
    }

    println!();
    if dry_run {
        println!("(dry run - no changes saved)");
    } else {
        println!("Saved to {}", paths.projects_path().display());
    }

    println!();
    println!(
        "NOTE: If your project's Caddyfile uses '{}' as the site address,",
        result.hostname
    );
    println!("      change it to ':80' so it accepts HTTP from the gateway.");
    println!();
    println!("Start your project normally - caddy-atc will auto-connect it.");

    Ok(())
}

async fn cmd_status(paths: &Paths) -> anyhow::Result<()> {
    let client = docker::connect().await?;

    if gateway::is_running(&client).await? {
        println!("Gateway: {}", "running".green());
    } else {
        println!("Gateway: {}", "stopped".red());
        return Ok(());
    }

    if pidfile::is_watcher_running(paths) {
        println!("Watcher: {}", "running".green());
    } else {
        println!("Watcher: {}", "stopped".red());
    }

    println!();

    let registry = Registry::load(paths)?;
    let active = caddy_atc::routes::list_active(&client, &registry)
        .await
        .context("listing routes")?;

    if active.is_empty() {
        println!("No active routes.");
        return Ok(());
    }

    println!("Active routes ({}):", active.len());
    print_route_table(&active);
    Ok(())
}

async fn cmd_routes(paths: &Paths) -> anyhow::Result<()> {
    let client = docker::connect().await?;
    let registry = Registry::load(paths)?;
    let active = caddy_atc::routes::list_active(&client, &registry).await?;

    if active.is_empty() {
        println!("No active routes.");
        return Ok(());
    }

    print_route_table(&active);
    Ok(())
}

#[derive(Tabled)]
struct RouteRow {
    #[tabled(rename = "HOSTNAME")]
    hostname: String,
    #[tabled(rename = "CONTAINER")]
    container: String,
    #[tabled(rename = "PORT")]
    port: String,
    #[tabled(rename = "PROJECT")]
    project: String,
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

fn print_route_table(active: &[ActiveRoute]) {
    let rows: Vec<RouteRow> = active
        .iter()
        .map(|a| RouteRow {
            hostname: a.route.hostname.cyan().to_string(),
            container: a.route.container_name.clone(),
            port: a.route.port.clone(),
            project: a.route.project.clone(),
            service: a.route.service.clone(),
            status: if a.status == "routed" {
                a.status.green().to_string()
            } else {
                a.status.yellow().to_string()
            },
        })
        .collect();

    let table = tabled::Table::new(&rows).with(Style::blank()).to_string();
    println!("{table}");
}

async fn cmd_logs(paths: &Paths, follow: bool) -> anyhow::Result<()> {
    let log_path = paths.log_path();
    if !log_path.exists() {
        println!("No watcher logs found.");
        return Ok(());
    }

    if follow {
        return gateway::follow_log(paths).await;
    }

    let data = std::fs::read_to_string(&log_path)
        .with_context(|| format!("reading {}", log_path.display()))?;
    print!("{data}");
    Ok(())
}
