use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tinyscheduler::config::{ConfigOverrides, SchedulerConfig};
use tinyscheduler::logging;
use tinyscheduler::supervisor::SupervisorOpts;

mod commands;

#[derive(Parser)]
#[command(name = "tinysched")]
#[command(about = "TinyScheduler - file-backed task scheduler for worker agent coordination")]
#[command(version)]
struct Cli {
    /// Base directory for all paths
    #[arg(long, global = true)]
    base_path: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler
    Run {
        /// Run one reconciliation pass and exit (cron-friendly)
        #[arg(long, conflicts_with = "daemon")]
        once: bool,

        /// Run continuously with interval sleeps
        #[arg(long)]
        daemon: bool,

        /// Show planned actions without making changes
        #[arg(long)]
        dry_run: bool,

        /// Disable task blocking (restore pre-blocking ordering exactly)
        #[arg(long)]
        disable_blocking: bool,

        /// Lease directory
        #[arg(long)]
        running_dir: Option<PathBuf>,

        /// Log directory
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Recipes directory
        #[arg(long)]
        recipes_dir: Option<PathBuf>,

        /// Path to the worker executable
        #[arg(long)]
        worker_bin: Option<PathBuf>,

        /// Task service endpoint
        #[arg(long)]
        endpoint: Option<String>,

        /// Concurrency limit for an agent (repeatable)
        #[arg(long = "agent-limit", value_name = "AGENT=SLOTS")]
        agent_limit: Vec<String>,

        /// Seconds between reconciliation passes in daemon mode
        #[arg(long, value_name = "SECONDS")]
        loop_interval: Option<u64>,

        /// Seconds between supervisor heartbeat updates
        #[arg(long, value_name = "SECONDS")]
        heartbeat_interval: Option<u64>,

        /// Maximum task runtime before a lease is considered stale
        #[arg(long, value_name = "SECONDS")]
        max_runtime: Option<u64>,
    },

    /// Validate configuration without running the scheduler
    ValidateConfig {
        /// Create missing directories and a default agent control file
        #[arg(long)]
        fix: bool,
    },

    /// Show the resolved configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Supervise a single task (spawned internally by `run`)
    #[command(hide = true)]
    Supervise {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        agent: String,
        /// Resolved recipe path
        #[arg(long)]
        recipe: PathBuf,
        #[arg(long)]
        lease_dir: PathBuf,
        #[arg(long)]
        log_dir: PathBuf,
        #[arg(long)]
        worker_bin: PathBuf,
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value_t = 15)]
        heartbeat_interval: u64,
        #[arg(long)]
        host: String,
    },
}

fn dispatch(cli: Cli) -> Result<i32> {
    let log_level = cli.log_level.clone();

    match cli.command {
        Commands::Run {
            once: _,
            daemon,
            dry_run,
            disable_blocking,
            running_dir,
            log_dir,
            recipes_dir,
            worker_bin,
            endpoint,
            agent_limit,
            loop_interval,
            heartbeat_interval,
            max_runtime,
        } => {
            let overrides = ConfigOverrides {
                base_path: cli.base_path,
                running_dir,
                log_dir,
                recipes_dir,
                worker_bin,
                endpoint,
                agent_limits: agent_limit,
                loop_interval_sec: loop_interval,
                heartbeat_interval_sec: heartbeat_interval,
                max_runtime_sec: max_runtime,
                log_level,
                dry_run,
                disable_blocking,
            };
            let config = match SchedulerConfig::load(&overrides) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("configuration error: {}", e);
                    return Ok(2);
                }
            };
            let file_dir = config.log_dir.is_dir().then(|| config.log_dir.clone());
            logging::init(&config.log_level, file_dir.as_deref(), "scheduler");
            commands::run::run(&config, daemon)
        }

        Commands::ValidateConfig { fix } => {
            let overrides = ConfigOverrides {
                base_path: cli.base_path,
                log_level,
                ..ConfigOverrides::default()
            };
            let config = match SchedulerConfig::load(&overrides) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("configuration error: {}", e);
                    return Ok(2);
                }
            };
            logging::init(&config.log_level, None, "scheduler");
            commands::validate_config::run(&config, fix)
        }

        Commands::Config { json } => {
            let overrides = ConfigOverrides {
                base_path: cli.base_path,
                log_level,
                ..ConfigOverrides::default()
            };
            let config = match SchedulerConfig::load(&overrides) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("configuration error: {}", e);
                    return Ok(2);
                }
            };
            logging::init(&config.log_level, None, "scheduler");
            commands::config_cmd::run(&config, json)
        }

        Commands::Supervise {
            task_id,
            agent,
            recipe,
            lease_dir,
            log_dir,
            worker_bin,
            endpoint,
            heartbeat_interval,
            host,
        } => {
            std::fs::create_dir_all(&log_dir).ok();
            logging::init(
                log_level.as_deref().unwrap_or("info"),
                Some(&log_dir),
                "supervisor",
            );
            commands::supervise::run(SupervisorOpts {
                task_id,
                agent,
                recipe,
                lease_dir,
                log_dir,
                worker_bin,
                endpoint,
                heartbeat_interval_sec: heartbeat_interval,
                host,
            })
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
