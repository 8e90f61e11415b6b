//! The supervisor: owns one task's end-to-end lifecycle.
//!
//! Spawned by the reconciler as a detached process, it writes the lease,
//! launches the worker, keeps the heartbeat fresh while the worker runs,
//! reports the outcome to the task service, and deletes the lease as its
//! final act. A crash here leaves the lease behind for the next
//! reconciliation pass to reclaim.

use anyhow::{Context, Result};
use serde_json::json;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::client::{TaskService, UpdateState};
use crate::format_duration;
use crate::lease::{Lease, LeaseError, LeaseStore};
use crate::validate;

/// Exit code when another supervisor already holds the lease.
pub const EXIT_LEASE_CONFLICT: i32 = 3;

/// Exit code for invalid arguments (identifiers, paths).
pub const EXIT_BAD_ARGS: i32 = 2;

/// Grace period between SIGTERM and SIGKILL when shutting the worker down.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Poll interval for the child-wait and heartbeat loops.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Everything a supervisor needs, received pre-validated on its command
/// line and re-validated here.
#[derive(Debug, Clone)]
pub struct SupervisorOpts {
    pub task_id: String,
    pub agent: String,
    /// Resolved recipe path (already confined to the recipes dir by the
    /// scheduler).
    pub recipe: PathBuf,
    pub lease_dir: PathBuf,
    pub log_dir: PathBuf,
    pub worker_bin: PathBuf,
    pub endpoint: String,
    pub heartbeat_interval_sec: u64,
    pub host: String,
}

impl SupervisorOpts {
    /// Defense in depth: everything was validated by the scheduler, and
    /// is validated again before this process trusts it.
    fn validate(&self) -> Result<()> {
        validate::validate_task_id(&self.task_id)?;
        validate::validate_agent_name(&self.agent)?;
        validate::validate_hostname(&self.host)?;

        let recipe_name = self.recipe.to_string_lossy();
        if !(recipe_name.ends_with(".yaml") || recipe_name.ends_with(".yml")) {
            anyhow::bail!("recipe must have .yaml or .yml extension: {}", recipe_name);
        }
        if !self.recipe.is_file() {
            anyhow::bail!("recipe not found: {}", self.recipe.display());
        }
        if self.heartbeat_interval_sec == 0 {
            anyhow::bail!("heartbeat interval must be positive");
        }
        Ok(())
    }
}

/// Periodically rewrites the lease heartbeat until stopped. Stopping and
/// joining this thread *before* the terminal-state write is what keeps
/// heartbeats and terminal writes mutually exclusive.
struct HeartbeatHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HeartbeatHandle {
    fn start(store: LeaseStore, task_id: String, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = thread::spawn(move || {
            let mut last_beat = Instant::now();
            while !stop_flag.load(Ordering::SeqCst) {
                thread::sleep(POLL_INTERVAL);
                if last_beat.elapsed() < interval {
                    continue;
                }
                last_beat = Instant::now();
                match store.update_heartbeat(&task_id) {
                    Ok(true) => debug!(task_id = %task_id, "heartbeat updated"),
                    Ok(false) => {
                        // Lease vanished underneath us (reclaimed); keep
                        // running, the worker may still finish useful work.
                        warn!(task_id = %task_id, "lease missing during heartbeat");
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "heartbeat write failed"),
                }
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

/// Wait for the worker, forwarding termination requests. On a shutdown
/// request the worker gets SIGTERM, a bounded grace period, then SIGKILL.
fn wait_for_worker(child: &mut Child, shutdown: &AtomicBool) -> Result<std::process::ExitStatus> {
    let pid = child.id();
    let mut term_sent_at: Option<Instant> = None;

    loop {
        if let Some(status) = child.try_wait().context("failed to poll worker")? {
            return Ok(status);
        }

        if shutdown.load(Ordering::SeqCst) && term_sent_at.is_none() {
            warn!(pid, "termination requested, signalling worker");
            #[cfg(unix)]
            send_signal(pid, libc::SIGTERM);
            #[cfg(not(unix))]
            let _ = child.kill();
            term_sent_at = Some(Instant::now());
        }

        if let Some(sent_at) = term_sent_at {
            if sent_at.elapsed() > TERM_GRACE {
                warn!(pid, "worker ignored SIGTERM, escalating");
                #[cfg(unix)]
                send_signal(pid, libc::SIGKILL);
                #[cfg(not(unix))]
                let _ = child.kill();
                let status = child.wait().context("failed to reap worker")?;
                return Ok(status);
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Run one task under supervision. Returns the process exit code.
pub fn run(opts: &SupervisorOpts, client: &dyn TaskService) -> Result<i32> {
    if let Err(e) = opts.validate() {
        error!(error = %e, "invalid supervisor arguments");
        return Ok(EXIT_BAD_ARGS);
    }

    info!(
        task_id = %opts.task_id,
        agent = %opts.agent,
        recipe = %opts.recipe.display(),
        "supervisor starting"
    );

    // Advisory metadata fetch; the task may legitimately be unknown to a
    // degraded service.
    if let Some(task) = client.get_task(&opts.task_id) {
        debug!(task_id = %task.id, status = ?task.status, "fetched task metadata");
    }

    let store = LeaseStore::open(&opts.lease_dir)
        .with_context(|| format!("failed to open lease dir {:?}", opts.lease_dir))?;

    let recipe_name = opts
        .recipe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lease = Lease::new(
        &opts.task_id,
        &opts.agent,
        std::process::id(),
        &recipe_name,
        &opts.host,
    );
    match store.create(&lease) {
        Ok(()) => {}
        Err(LeaseError::Conflict(_)) => {
            // Someone else owns this task; their lease must stay intact.
            error!(task_id = %opts.task_id, "lease already exists, aborting");
            return Ok(EXIT_LEASE_CONFLICT);
        }
        Err(e) => return Err(e).context("failed to create lease"),
    }

    client.update_state(&opts.task_id, UpdateState::Working, json!({}));

    let started = Instant::now();
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
            warn!(error = %e, "failed to install signal handler");
        }
    }

    let mut child = match spawn_worker(opts) {
        Ok(child) => child,
        Err(e) => {
            error!(task_id = %opts.task_id, error = %e, "failed to spawn worker");
            client.update_state(
                &opts.task_id,
                UpdateState::Failed,
                json!({ "error": e.to_string() }),
            );
            if let Err(del) = store.delete(&opts.task_id) {
                error!(task_id = %opts.task_id, error = %del, "failed to delete lease");
            }
            return Ok(1);
        }
    };
    info!(task_id = %opts.task_id, worker_pid = child.id(), "worker started");

    let heartbeat = HeartbeatHandle::start(
        store.clone(),
        opts.task_id.clone(),
        Duration::from_secs(opts.heartbeat_interval_sec),
    );

    let status = wait_for_worker(&mut child, &shutdown);

    // Terminal-state writes only begin once the heartbeat thread is gone.
    heartbeat.stop();

    let duration_sec = started.elapsed().as_secs() as i64;
    let (outcome, exit_code) = match &status {
        Ok(status) if status.success() => (UpdateState::Completed, 0),
        Ok(status) => (UpdateState::Failed, status.code().unwrap_or(-1)),
        Err(e) => {
            error!(task_id = %opts.task_id, error = %e, "lost track of worker");
            (UpdateState::Failed, -1)
        }
    };
    info!(
        task_id = %opts.task_id,
        outcome = outcome.as_str(),
        exit_code,
        duration = %format_duration(duration_sec, false),
        "worker finished"
    );

    if let Ok(Some(mut current)) = store.get(&opts.task_id) {
        current.state = match outcome {
            UpdateState::Completed => crate::lease::LeaseState::Completed,
            _ => crate::lease::LeaseState::Failed,
        };
        if let Err(e) = store.update(&current) {
            warn!(task_id = %opts.task_id, error = %e, "failed to record terminal lease state");
        }
    }

    let reported = client.update_state(
        &opts.task_id,
        outcome,
        json!({
            "exit_code": exit_code,
            "duration_sec": duration_sec,
            "host": opts.host,
        }),
    );
    if !reported {
        warn!(task_id = %opts.task_id, "failed to report outcome to task service");
    }

    // Deleting the lease releases the task; it must happen even when the
    // report above failed.
    match store.delete(&opts.task_id) {
        Ok(_) => debug!(task_id = %opts.task_id, "lease deleted"),
        Err(e) => {
            error!(task_id = %opts.task_id, error = %e, "failed to delete lease");
            return Ok(1);
        }
    }

    Ok(0)
}

fn spawn_worker(opts: &SupervisorOpts) -> Result<Child> {
    let log_path = opts.log_dir.join(format!("task_{}.log", opts.task_id));
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open worker log {:?}", log_path))?;
    let stderr_file = log_file
        .try_clone()
        .context("failed to clone worker log handle")?;

    Command::new(&opts.worker_bin)
        .arg("--recipe")
        .arg(&opts.recipe)
        .arg("--task-id")
        .arg(&opts.task_id)
        .arg("--agent")
        .arg(&opts.agent)
        .arg("--endpoint")
        .arg(&opts.endpoint)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .with_context(|| format!("failed to exec worker {:?}", opts.worker_bin))
}
