//! The reconciliation engine.
//!
//! One pass re-derives the world from the lease directory and the task
//! service: scan leases, reclaim stale ones, then hand free slots to
//! waiting tasks. Passes are serialized by an advisory lock on a fixed
//! lock file, which is what makes overlapping cron invocations safe.

use anyhow::{Context, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, error, info, warn};

use crate::blocking;
use crate::client::{Task, TaskService, UpdateState};
use crate::config::SchedulerConfig;
use crate::lease::{LeaseHealth, LeaseStore};
use crate::registry::AgentRegistry;
use crate::validate;

/// Exclusive advisory lock on a dedicated file.
///
/// The lock is the flock itself, never the file's existence, so a crashed
/// holder cannot block the next run. The file is left in place on
/// release.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
        }
    }

    /// Try to acquire the lock without blocking. Returns `false` when
    /// another process holds it; errors are real I/O failures.
    #[cfg(unix)]
    pub fn acquire(&mut self) -> Result<bool> {
        use std::os::unix::io::AsRawFd;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("failed to open lock file {:?}", self.path))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Ok(false);
            }
            return Err(err).with_context(|| format!("failed to lock {:?}", self.path));
        }

        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;
        self.file = Some(file);
        Ok(true)
    }

    #[cfg(not(unix))]
    pub fn acquire(&mut self) -> Result<bool> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        self.file = Some(file);
        Ok(true)
    }

    /// Drop the lock. The file stays behind; only the flock matters.
    pub fn release(&mut self) {
        #[cfg(unix)]
        if let Some(file) = self.file.take() {
            use std::os::unix::io::AsRawFd;
            unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        }
        #[cfg(not(unix))]
        {
            self.file = None;
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub leases_scanned: u64,
    pub leases_reclaimed: u64,
    pub tasks_spawned: u64,
    pub assigned_spawned: u64,
    pub unassigned_matched: u64,
    pub tasks_blocked: u64,
    pub errors: u64,
}

/// What the scheduler needs to launch one supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub task_id: String,
    pub agent: String,
    pub recipe_path: PathBuf,
}

/// Seam between the scheduling decision and process creation. The
/// production implementation execs this binary's `supervise` subcommand;
/// tests record the requests instead.
pub trait SupervisorSpawner {
    /// Launch a supervisor, returning its pid.
    fn spawn(&self, request: &SpawnRequest) -> Result<u32>;
}

/// Spawns detached supervisor processes in their own process group.
pub struct ProcessSpawner {
    exe: PathBuf,
    config: SchedulerConfig,
}

impl ProcessSpawner {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let exe = std::env::current_exe().context("failed to locate scheduler executable")?;
        Ok(Self {
            exe,
            config: config.clone(),
        })
    }
}

impl SupervisorSpawner for ProcessSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32> {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("supervise")
            .arg("--task-id")
            .arg(&request.task_id)
            .arg("--agent")
            .arg(&request.agent)
            .arg("--recipe")
            .arg(&request.recipe_path)
            .arg("--lease-dir")
            .arg(&self.config.running_dir)
            .arg("--log-dir")
            .arg(&self.config.log_dir)
            .arg("--worker-bin")
            .arg(&self.config.worker_bin)
            .arg("--endpoint")
            .arg(&self.config.endpoint)
            .arg("--heartbeat-interval")
            .arg(self.config.heartbeat_interval_sec.to_string())
            .arg("--host")
            .arg(&self.config.hostname)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .current_dir(&self.config.base_path);

        // Detach: the supervisor must outlive this scheduler process.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn supervisor for task {}", request.task_id))?;
        Ok(child.id())
    }
}

/// The reconciler: owns one pass at a time, composable into a daemon.
pub struct Scheduler<'a> {
    config: &'a SchedulerConfig,
    store: LeaseStore,
    client: &'a dyn TaskService,
    registry: Option<AgentRegistry>,
    spawner: &'a dyn SupervisorSpawner,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: &'a SchedulerConfig,
        registry: Option<AgentRegistry>,
        client: &'a dyn TaskService,
        spawner: &'a dyn SupervisorSpawner,
    ) -> Result<Self> {
        let store = LeaseStore::open(&config.running_dir)
            .with_context(|| format!("failed to open lease dir {:?}", config.running_dir))?;
        Ok(Self {
            config,
            store,
            client,
            registry,
            spawner,
        })
    }

    pub fn lease_store(&self) -> &LeaseStore {
        &self.store
    }

    /// Run one idempotent reconciliation pass.
    pub fn reconcile(&mut self) -> ReconcileStats {
        info!(
            hostname = %self.config.hostname,
            dry_run = self.config.dry_run,
            "starting reconciliation pass"
        );
        let mut stats = ReconcileStats::default();

        if self.scan_and_reclaim(&mut stats) {
            let queue_mode = self
                .registry
                .as_ref()
                .map(|r| !r.is_empty())
                .unwrap_or(false);
            if queue_mode {
                self.process_unassigned(&mut stats);
                self.process_assigned(&mut stats);
            } else {
                self.process_legacy(&mut stats);
            }
        }

        info!(
            leases_scanned = stats.leases_scanned,
            leases_reclaimed = stats.leases_reclaimed,
            tasks_spawned = stats.tasks_spawned,
            assigned_spawned = stats.assigned_spawned,
            unassigned_matched = stats.unassigned_matched,
            tasks_blocked = stats.tasks_blocked,
            errors = stats.errors,
            "reconciliation pass complete"
        );
        stats
    }

    /// Step 1: enumerate leases and reclaim every non-healthy one.
    /// Reclamation happens strictly before any spawn decision, so spawns
    /// never race reclaims for the same task. Returns false when the
    /// lease directory is unreadable, which aborts the whole pass.
    fn scan_and_reclaim(&mut self, stats: &mut ReconcileStats) -> bool {
        let leases = match self.store.list() {
            Ok(leases) => leases,
            Err(e) => {
                error!(error = %e, "failed to scan lease directory, aborting pass");
                stats.errors += 1;
                return false;
            }
        };
        stats.leases_scanned = leases.len() as u64;
        debug!(count = leases.len(), "scanned leases");

        let now = crate::lease::utc_now_secs();
        for lease in leases {
            let health = lease.classify(
                now,
                self.config.heartbeat_interval_sec,
                self.config.max_runtime_sec,
            );
            let (reason, requeue_as) = match health {
                LeaseHealth::Healthy => continue,
                LeaseHealth::DeadProcess => (
                    format!("process {} is not alive", lease.pid),
                    UpdateState::Idle,
                ),
                LeaseHealth::OverMaxRuntime => (
                    format!(
                        "runtime exceeded {}s (actual: {}s)",
                        self.config.max_runtime_sec,
                        lease.age_seconds(now)
                    ),
                    UpdateState::Failed,
                ),
                LeaseHealth::StaleHeartbeat => (
                    format!("heartbeat stale ({}s old)", lease.heartbeat_age_seconds(now)),
                    UpdateState::Idle,
                ),
            };

            warn!(
                task_id = %lease.task_id,
                agent = %lease.agent,
                reason = %reason,
                "stale lease detected"
            );

            if self.config.dry_run {
                info!(task_id = %lease.task_id, "[dry run] would reclaim lease");
                continue;
            }

            match self.store.delete(&lease.task_id) {
                Ok(_) => {
                    stats.leases_reclaimed += 1;
                    let ok = self.client.update_state(
                        &lease.task_id,
                        requeue_as,
                        json!({ "reason": reason }),
                    );
                    if ok {
                        info!(
                            task_id = %lease.task_id,
                            state = requeue_as.as_str(),
                            "reclaimed lease and updated task"
                        );
                    } else {
                        warn!(task_id = %lease.task_id, "lease reclaimed but task update failed");
                        stats.errors += 1;
                    }
                }
                Err(e) => {
                    error!(task_id = %lease.task_id, error = %e, "failed to delete stale lease");
                    stats.errors += 1;
                }
            }
        }
        true
    }

    /// Free slots for one agent: limit minus running leases.
    fn free_slots(&self, agent: &str) -> u32 {
        let limit = self.config.limit_for(agent);
        let active = self.store.count_by_agent(agent).unwrap_or_else(|e| {
            warn!(agent, error = %e, "failed to count leases, assuming at capacity");
            limit as usize
        });
        limit.saturating_sub(active as u32)
    }

    /// Resolve the recipe for a task, defaulting to `<agent>.yaml`.
    fn resolve_recipe(&self, task: &Task, agent: &str) -> Option<PathBuf> {
        let name = task
            .recipe
            .clone()
            .unwrap_or_else(|| format!("{}.yaml", agent));
        match validate::validate_recipe_path(&name, &self.config.recipes_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(task_id = %task.id, recipe = %name, error = %e, "skipping task with unusable recipe");
                None
            }
        }
    }

    fn launch(&self, task_id: &str, agent: &str, recipe_path: &Path) -> bool {
        if validate::validate_task_id(task_id).is_err()
            || validate::validate_agent_name(agent).is_err()
        {
            warn!(task_id, agent, "refusing to spawn with invalid identifiers");
            return false;
        }
        let request = SpawnRequest {
            task_id: task_id.to_string(),
            agent: agent.to_string(),
            recipe_path: recipe_path.to_path_buf(),
        };
        match self.spawner.spawn(&request) {
            Ok(pid) => {
                debug!(task_id, agent, pid, "spawned supervisor");
                true
            }
            Err(e) => {
                error!(task_id, agent, error = %e, "failed to spawn supervisor");
                false
            }
        }
    }

    /// Step 3 (queue mode): match unassigned tasks to the agent with the
    /// most free capacity, ties broken by lexicographically smallest
    /// agent name.
    fn process_unassigned(&mut self, stats: &mut ReconcileStats) {
        let registry = self.registry.as_ref().expect("queue mode requires registry");
        let queues: Vec<String> = registry.queues().iter().map(|q| q.to_string()).collect();

        for queue in queues {
            let agents: Vec<String> = self
                .registry
                .as_ref()
                .unwrap()
                .agents_for_queue(&queue)
                .iter()
                .map(|a| a.to_string())
                .collect();
            if agents.is_empty() {
                continue;
            }

            let mut free: BTreeMap<String, u32> = BTreeMap::new();
            for agent in &agents {
                let slots = self.free_slots(agent);
                debug!(queue = %queue, agent = %agent, slots, "free slots");
                free.insert(agent.clone(), slots);
            }
            let total: u32 = free.values().sum();
            if total == 0 {
                debug!(queue = %queue, "no free slots, skipping queue");
                continue;
            }

            let fetched = self
                .client
                .get_unassigned_in_queue(&queue, total as usize);
            info!(queue = %queue, count = fetched.len(), "fetched unassigned tasks");

            let (ordered, blocked) =
                blocking::plan_spawn_order(fetched, self.config.disable_blocking);
            stats.tasks_blocked += blocked as u64;

            for task in ordered {
                let Some(best) = best_agent(&free) else {
                    break;
                };
                let Some(recipe_path) = self.resolve_recipe(&task, &best) else {
                    continue;
                };

                if self.config.dry_run {
                    info!(
                        task_id = %task.id,
                        agent = %best,
                        "[dry run] would assign and spawn"
                    );
                    *free.get_mut(&best).unwrap() -= 1;
                    stats.unassigned_matched += 1;
                    continue;
                }

                if !self.client.assign(&task.id, &best) {
                    error!(task_id = %task.id, agent = %best, "assignment failed");
                    stats.errors += 1;
                    continue;
                }
                if self.launch(&task.id, &best, &recipe_path) {
                    *free.get_mut(&best).unwrap() -= 1;
                    stats.unassigned_matched += 1;
                    stats.tasks_spawned += 1;
                } else {
                    stats.errors += 1;
                }
            }
        }
    }

    /// Step 4 (queue mode): spawn supervisors for idle tasks already
    /// assigned to each agent. Blocked tasks are filtered; the service's
    /// own ordering is otherwise kept.
    fn process_assigned(&mut self, stats: &mut ReconcileStats) {
        let agents: Vec<String> = self
            .registry
            .as_ref()
            .expect("queue mode requires registry")
            .agent_names()
            .iter()
            .map(|a| a.to_string())
            .collect();

        for agent in agents {
            let free = self.free_slots(&agent);
            if free == 0 {
                debug!(agent = %agent, "no free slots");
                continue;
            }

            let fetched = self.client.list_idle_tasks(&agent, free as usize);
            info!(agent = %agent, count = fetched.len(), "fetched assigned idle tasks");

            let (tasks, blocked) = if self.config.disable_blocking {
                (fetched, 0)
            } else {
                blocking::filter_blocked(fetched)
            };
            stats.tasks_blocked += blocked as u64;

            for task in tasks.into_iter().take(free as usize) {
                let Some(recipe_path) = self.resolve_recipe(&task, &agent) else {
                    continue;
                };
                if self.config.dry_run {
                    info!(task_id = %task.id, agent = %agent, "[dry run] would spawn");
                    stats.assigned_spawned += 1;
                    continue;
                }
                if self.launch(&task.id, &agent, &recipe_path) {
                    stats.assigned_spawned += 1;
                    stats.tasks_spawned += 1;
                } else {
                    stats.errors += 1;
                }
            }
        }
    }

    /// Legacy mode: no registry, walk the configured agent-limits map.
    fn process_legacy(&mut self, stats: &mut ReconcileStats) {
        debug!("agent registry unavailable, using legacy agent limits");
        let agents: Vec<String> = self.config.agent_limits.keys().cloned().collect();

        for agent in agents {
            let free = self.free_slots(&agent);
            if free == 0 {
                debug!(agent = %agent, "no free slots");
                continue;
            }

            let fetched = self.client.list_idle_tasks(&agent, free as usize);
            info!(agent = %agent, count = fetched.len(), "fetched idle tasks");

            let (ordered, blocked) =
                blocking::plan_spawn_order(fetched, self.config.disable_blocking);
            stats.tasks_blocked += blocked as u64;

            for task in ordered.into_iter().take(free as usize) {
                let Some(recipe_path) = self.resolve_recipe(&task, &agent) else {
                    continue;
                };
                if self.config.dry_run {
                    info!(task_id = %task.id, agent = %agent, "[dry run] would spawn");
                    continue;
                }
                if self.launch(&task.id, &agent, &recipe_path) {
                    stats.tasks_spawned += 1;
                } else {
                    stats.errors += 1;
                }
            }
        }
    }
}

/// Agent with the most free slots; ties go to the lexicographically
/// smallest name. `None` when nobody has capacity.
fn best_agent(free: &BTreeMap<String, u32>) -> Option<String> {
    let mut best: Option<(&String, u32)> = None;
    for (agent, &slots) in free {
        if slots == 0 {
            continue;
        }
        match best {
            // Strictly-greater keeps the first (smallest) name on ties.
            Some((_, best_slots)) if slots <= best_slots => {}
            _ => best = Some((agent, slots)),
        }
    }
    best.map(|(agent, _)| agent.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_best_agent_prefers_most_slots() {
        let free = BTreeMap::from([
            ("vaela".to_string(), 3),
            ("damien".to_string(), 2),
        ]);
        assert_eq!(best_agent(&free), Some("vaela".to_string()));
    }

    #[test]
    fn test_best_agent_ties_break_lexicographically() {
        let free = BTreeMap::from([
            ("vaela".to_string(), 2),
            ("damien".to_string(), 2),
        ]);
        assert_eq!(best_agent(&free), Some("damien".to_string()));
    }

    #[test]
    fn test_best_agent_skips_exhausted() {
        let free = BTreeMap::from([
            ("vaela".to_string(), 0),
            ("damien".to_string(), 1),
        ]);
        assert_eq!(best_agent(&free), Some("damien".to_string()));

        let empty = BTreeMap::from([("vaela".to_string(), 0)]);
        assert_eq!(best_agent(&empty), None);
    }

    #[test]
    fn test_lock_acquire_and_contend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");

        let mut first = LockFile::new(&path);
        assert!(first.acquire().unwrap());
        assert!(first.is_held());

        let mut second = LockFile::new(&path);
        assert!(!second.acquire().unwrap());
        assert!(!second.is_held());

        first.release();
        assert!(second.acquire().unwrap());
    }

    #[test]
    fn test_lock_reacquire_after_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");

        {
            let mut lock = LockFile::new(&path);
            assert!(lock.acquire().unwrap());
        }
        // Leftover lock file does not block the next run.
        assert!(path.exists());
        let mut lock = LockFile::new(&path);
        assert!(lock.acquire().unwrap());
    }

    #[test]
    fn test_lock_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("deep").join("test.lock");
        let mut lock = LockFile::new(&path);
        assert!(lock.acquire().unwrap());
    }
}
