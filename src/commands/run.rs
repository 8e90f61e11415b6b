//! `run` command: one reconciliation pass, or the perpetual daemon.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use tinyscheduler::client::{HttpTaskClient, RetryPolicy, DEFAULT_TIMEOUT};
use tinyscheduler::config::SchedulerConfig;
use tinyscheduler::registry::AgentRegistry;
use tinyscheduler::scheduler::{LockFile, ProcessSpawner, Scheduler};

/// Run the scheduler under lock-file protection.
///
/// Lock contention is a skip, not a failure: overlapping cron
/// invocations are expected and the holder is doing the work.
pub fn run(config: &SchedulerConfig, daemon: bool) -> Result<i32> {
    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("configuration: {}", e);
        }
        return Ok(2);
    }
    config
        .ensure_directories()
        .context("failed to create state directories")?;

    let registry = if config.agent_control_file.exists() {
        match AgentRegistry::load(&config.agent_control_file) {
            Ok(registry) => {
                info!(
                    path = %config.agent_control_file.display(),
                    agents = registry.len(),
                    queues = registry.queues().len(),
                    "loaded agent registry"
                );
                Some(registry)
            }
            Err(e) => {
                error!(
                    path = %config.agent_control_file.display(),
                    error = %e,
                    "invalid agent control file"
                );
                return Ok(2);
            }
        }
    } else {
        warn!(
            path = %config.agent_control_file.display(),
            "agent control file not found, queue mode disabled (legacy agent limits only)"
        );
        None
    };

    let client = HttpTaskClient::new(&config.endpoint, DEFAULT_TIMEOUT, RetryPolicy::default())
        .context("failed to build task service client")?;
    let spawner = ProcessSpawner::new(config)?;

    let mut lock = LockFile::new(&config.lock_file);
    if !lock.acquire()? {
        warn!(
            lock_file = %config.lock_file.display(),
            "another scheduler instance holds the lock, skipping"
        );
        return Ok(0);
    }

    let mut scheduler = Scheduler::new(config, registry, &client, &spawner)?;

    if daemon {
        run_daemon(&mut scheduler, config.loop_interval_sec)
    } else {
        let stats = scheduler.reconcile();
        Ok(if stats.errors == 0 { 0 } else { 1 })
    }
}

fn run_daemon(scheduler: &mut Scheduler, loop_interval_sec: u64) -> Result<i32> {
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
            warn!(error = %e, "failed to install signal handler");
        }
    }

    info!(interval = loop_interval_sec, "scheduler daemon starting");
    while !shutdown.load(Ordering::SeqCst) {
        scheduler.reconcile();

        let mut slept = 0;
        while slept < loop_interval_sec && !shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
            slept += 1;
        }
    }
    info!("scheduler daemon shutting down");
    Ok(0)
}
