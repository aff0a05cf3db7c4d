mod bot;
mod builder;
mod collector;
mod config;
mod docker;
mod error;
mod registry;
mod supervisor;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bot::{BotState, ControlAction, Platform, ResourceLimits};
use builder::ImageBuilder;
use collector::Collector;
use config::WardenConfig;
use docker::DockerCli;
use error::{Result, SupervisorError};
use registry::{ContainerRecord, Registry};
use supervisor::{DeploySpec, Supervisor};

const BULLET_GREEN: &str = "\x1b[32m●\x1b[0m";
const BULLET_BLUE: &str = "\x1b[34m●\x1b[0m";
const BULLET_YELLOW: &str = "\x1b[33m●\x1b[0m";
const BULLET_RED: &str = "\x1b[31m●\x1b[0m";

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "warden — container supervisor for tenant-owned Telegram bot workers", long_about = None)]
struct Cli {
    /// Tenant namespace for all operations
    #[arg(long, global = true, default_value = "default")]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the local environment
    Doctor,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
    /// Build an image for a bot script and start it
    Deploy {
        /// Path to the bot script
        script: PathBuf,
        /// Display name for the bot
        #[arg(long)]
        name: String,
        /// Bot identifier (generated if omitted)
        #[arg(long)]
        id: Option<String>,
        /// Target platform: linux, android, or windows
        #[arg(long, default_value = "linux")]
        platform: String,
        /// Optional requirements manifest
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Bot token (falls back to TELEGRAM_BOT_TOKEN)
        #[arg(long)]
        token: Option<String>,
        /// Memory ceiling in MiB
        #[arg(long)]
        memory_mib: Option<u64>,
        /// CPU ceiling as a fraction of one core
        #[arg(long)]
        cpus: Option<f64>,
        /// Scratch storage ceiling in MiB
        #[arg(long)]
        storage_mib: Option<u64>,
    },
    /// Start a stopped bot
    Start { id: String },
    /// Stop a running bot
    Stop { id: String },
    /// Restart a bot
    Restart { id: String },
    /// Remove a stopped bot and its container
    Remove { id: String },
    /// Show a bot's registry record
    Status { id: String },
    /// Show recent log lines for a bot
    Logs {
        id: String,
        #[arg(long, default_value_t = 100)]
        lines: usize,
    },
    /// Show metrics for one bot, or the whole tenant fleet
    Metrics { id: Option<String> },
    /// List the tenant's bots
    List,
    /// Show the audit trail for a bot
    History {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Supervise in the foreground: poll status until interrupted
    Run,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show config file path
    Path,
    /// Write a config file with the default settings
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {} (code: {})", e, e.error_code());
        std::process::exit(1);
    }
}

fn open_supervisor(cfg: &WardenConfig) -> Result<(Supervisor, Arc<DockerCli>)> {
    let registry = Registry::open(&cfg.db_path(), cfg.max_bots_per_tenant)?;
    let runtime = Arc::new(DockerCli::new(
        cfg.docker_bin.clone(),
        Duration::from_secs(cfg.op_timeout_secs),
    ));
    let builder = ImageBuilder::new(
        cfg.docker_bin.clone(),
        Duration::from_secs(cfg.build_timeout_secs),
    );
    Ok((
        Supervisor::new(registry, runtime.clone(), builder),
        runtime,
    ))
}

async fn dispatch(cli: Cli) -> Result<()> {
    let cfg = config::load_config()?;
    let tenant = cli.tenant;

    match cli.command {
        Commands::Doctor => {
            println!("Doctor: validating environment...");
            match docker::check_docker_available(&cfg.docker_bin).await {
                Ok(()) => println!("  {} {} - available", BULLET_GREEN, cfg.docker_bin),
                Err(e) => println!("  {} {} - {}", BULLET_RED, cfg.docker_bin, e),
            }
            match config::config_file_path() {
                Ok(path) => println!("  {} config: {}", BULLET_GREEN, path.display()),
                Err(e) => println!("  {} config: {}", BULLET_RED, e),
            }
            println!("  {} registry: {}", BULLET_GREEN, cfg.db_path().display());
            Ok(())
        }
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Path => {
                println!("{}", config::config_file_path()?.display());
                Ok(())
            }
            ConfigCommands::Init => {
                let path = config::config_file_path()?;
                if path.exists() {
                    return Err(SupervisorError::InvalidInput(format!(
                        "config already exists at {}",
                        path.display()
                    )));
                }
                config::save_config(&WardenConfig::default())?;
                println!("  {} Wrote {}", BULLET_GREEN, path.display());
                Ok(())
            }
        },
        Commands::Deploy {
            script,
            name,
            id,
            platform,
            manifest,
            token,
            memory_mib,
            cpus,
            storage_mib,
        } => {
            let platform = Platform::from_str(&platform).ok_or_else(|| {
                SupervisorError::InvalidInput(format!(
                    "unsupported platform '{}' (expected linux, android, or windows)",
                    platform
                ))
            })?;
            let token = token
                .or_else(|| std::env::var("TELEGRAM_BOT_TOKEN").ok())
                .ok_or_else(|| {
                    SupervisorError::InvalidInput(
                        "no bot token given (use --token or TELEGRAM_BOT_TOKEN)".to_string(),
                    )
                })?;

            let script_bytes = std::fs::read(&script)?;
            let manifest_bytes = match &manifest {
                Some(path) => Some(std::fs::read(path)?),
                None => None,
            };

            let defaults = ResourceLimits::default();
            let limits = ResourceLimits {
                memory_mib: memory_mib.unwrap_or(defaults.memory_mib),
                cpus: cpus.unwrap_or(defaults.cpus),
                storage_mib: storage_mib.unwrap_or(defaults.storage_mib),
            };

            println!("  {} Deploying {} ({})", BULLET_BLUE, name, platform);
            let (sup, _) = open_supervisor(&cfg)?;
            let record = sup
                .deploy(
                    &tenant,
                    DeploySpec {
                        id,
                        name,
                        platform,
                        limits,
                        token,
                    },
                    &script_bytes,
                    manifest_bytes.as_deref(),
                )
                .await?;
            println!("  {} Bot {} is {}", BULLET_GREEN, record.bot_id, record.observed_state);
            println!("       Container: {}", record.container_id.as_deref().unwrap_or("-"));
            println!("       Health port: {}", record.health_port);
            Ok(())
        }
        Commands::Start { id } => control(&cfg, &id, ControlAction::Start).await,
        Commands::Stop { id } => control(&cfg, &id, ControlAction::Stop).await,
        Commands::Restart { id } => control(&cfg, &id, ControlAction::Restart).await,
        Commands::Remove { id } => control(&cfg, &id, ControlAction::Remove).await,
        Commands::Status { id } => {
            let (sup, _) = open_supervisor(&cfg)?;
            print_record(&sup.status(&id)?);
            Ok(())
        }
        Commands::Logs { id, lines } => {
            let (sup, _) = open_supervisor(&cfg)?;
            let log_lines = sup.logs(&id, lines).await?;
            if log_lines.is_empty() {
                println!("(no log output)");
            }
            for line in log_lines {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Metrics { id } => {
            let (sup, _) = open_supervisor(&cfg)?;
            match id {
                Some(id) => {
                    let snap = sup.metrics(&id).await?;
                    print_snapshot(&snap);
                }
                None => {
                    let (snapshots, agg) = sup.metrics_all(&tenant).await?;
                    if snapshots.is_empty() {
                        println!("No bots for tenant '{}'", tenant);
                        return Ok(());
                    }
                    for snap in &snapshots {
                        print_snapshot(snap);
                    }
                    println!(
                        "  {} fleet: {} bots, {} running, {} messages, {} errors, {:.1} MiB",
                        BULLET_BLUE,
                        agg.bots,
                        agg.running,
                        agg.total_messages,
                        agg.total_errors,
                        agg.total_mem_mib
                    );
                }
            }
            Ok(())
        }
        Commands::List => {
            let (sup, _) = open_supervisor(&cfg)?;
            let records = sup.list(&tenant)?;
            if records.is_empty() {
                println!("No bots for tenant '{}'", tenant);
            } else {
                println!("Bots for tenant '{}':", tenant);
                for record in &records {
                    print_record(record);
                }
            }
            Ok(())
        }
        Commands::History { id, limit } => {
            let (sup, _) = open_supervisor(&cfg)?;
            let attempts = sup.history(&id, limit)?;
            if attempts.is_empty() {
                println!("No recorded operations for '{}'", id);
            }
            for attempt in attempts {
                match attempt.error {
                    Some(err) => println!(
                        "  {} {} {}: {} -> {} ({})",
                        BULLET_RED,
                        attempt.at.format("%Y-%m-%d %H:%M:%S"),
                        attempt.action,
                        attempt.from_state,
                        attempt.to_state,
                        err
                    ),
                    None => println!(
                        "  {} {} {}: {} -> {}",
                        BULLET_GREEN,
                        attempt.at.format("%Y-%m-%d %H:%M:%S"),
                        attempt.action,
                        attempt.from_state,
                        attempt.to_state
                    ),
                }
            }
            Ok(())
        }
        Commands::Run => {
            let registry = Registry::open(&cfg.db_path(), cfg.max_bots_per_tenant)?;
            let runtime = Arc::new(DockerCli::new(
                cfg.docker_bin.clone(),
                Duration::from_secs(cfg.op_timeout_secs),
            ));

            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            ctrlc::set_handler(move || {
                flag.store(true, Ordering::SeqCst);
            })
            .map_err(|e| {
                SupervisorError::InvalidInput(format!("failed to install signal handler: {}", e))
            })?;

            println!(
                "  {} Supervising (poll every {}s, ctrl-c to stop)",
                BULLET_BLUE, cfg.poll_interval_secs
            );
            let collector = Collector::new(
                registry,
                runtime,
                Duration::from_secs(cfg.poll_interval_secs),
                cfg.poll_failure_threshold,
                Duration::from_secs(cfg.build_timeout_secs),
            );
            collector.run(shutdown).await;
            println!("  {} Supervisor stopped", BULLET_GREEN);
            Ok(())
        }
    }
}

async fn control(cfg: &WardenConfig, id: &str, action: ControlAction) -> Result<()> {
    let (sup, _) = open_supervisor(cfg)?;
    sup.control(id, action).await?;
    match action {
        ControlAction::Remove => println!("  {} Bot {} removed", BULLET_GREEN, id),
        _ => {
            let record = sup.status(id)?;
            println!(
                "  {} Bot {} is {}",
                state_bullet(record.observed_state),
                id,
                record.observed_state
            );
        }
    }
    Ok(())
}

fn state_bullet(state: BotState) -> &'static str {
    match state {
        BotState::Running => BULLET_GREEN,
        BotState::Building | BotState::Starting | BotState::Stopping => BULLET_YELLOW,
        BotState::Stopped => BULLET_BLUE,
        BotState::Error => BULLET_RED,
    }
}

fn print_record(record: &ContainerRecord) {
    println!(
        "  {} {} ({}) - {} [desired {}]",
        state_bullet(record.observed_state),
        record.bot_id,
        record.name,
        record.observed_state,
        record.desired_state.as_str()
    );
    println!(
        "       platform: {}, limits: {} MiB / {} cpus / {} MiB scratch",
        record.platform,
        record.limits.memory_mib,
        record.limits.cpus,
        record.limits.storage_mib
    );
    if let Some(container_id) = &record.container_id {
        let short = &container_id[..container_id.len().min(12)];
        println!("       container: {} (health port {})", short, record.health_port);
    }
    if let (Some(mem), Some(cpu)) = (record.mem_usage_mib, record.cpu_usage_percent) {
        println!("       usage: {:.1} MiB, {:.1}% cpu", mem, cpu);
    }
    if let Some(err) = &record.last_error {
        println!("       last error: {}", err);
    }
}

fn print_snapshot(snap: &collector::MetricsSnapshot) {
    let source = if snap.from_sidecar { "sidecar" } else { "logs" };
    println!(
        "  {} {} - {} | messages: {}, errors: {} ({})",
        state_bullet(snap.state),
        snap.bot_id,
        snap.state,
        snap.message_count,
        snap.error_count,
        source
    );
    if let Some(uptime) = snap.uptime_secs {
        println!("       uptime: {}s", uptime);
    }
    if let (Some(mem), Some(cpu)) = (snap.mem_mib, snap.cpu_percent) {
        println!("       usage: {:.1} MiB, {:.1}% cpu", mem, cpu);
    }
}
