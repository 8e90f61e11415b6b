//! Lease files: one JSON document per in-flight task.
//!
//! A lease on disk means "some supervisor claims to own this task on this
//! host". Ownership ends when the file is removed. All writes go through
//! a temp-file-then-rename sequence so concurrent readers never observe a
//! partial document, and lease files are created mode 0600.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::validate::{self, ValidationError};

/// Lease lifecycle state. Terminal states are only briefly observable
/// before the supervisor deletes the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    #[default]
    Running,
    Completed,
    Failed,
}

/// Health classification for a lease, in descending reclaim priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseHealth {
    Healthy,
    /// The supervisor pid no longer exists on this host.
    DeadProcess,
    /// The task has been running longer than the configured maximum.
    OverMaxRuntime,
    /// No heartbeat within max(3 * heartbeat_interval, 60s).
    StaleHeartbeat,
}

/// RFC 3339 timestamps with a `Z` suffix, matching the on-disk format.
mod rfc3339z {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// A task execution lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: String,
    pub agent: String,
    /// The supervisor's own pid, not the worker's.
    pub pid: u32,
    pub recipe: String,
    #[serde(with = "rfc3339z")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "rfc3339z")]
    pub heartbeat: DateTime<Utc>,
    pub host: String,
    #[serde(default)]
    pub state: LeaseState,
}

/// Current time truncated to whole seconds, the precision leases carry.
pub fn utc_now_secs() -> DateTime<Utc> {
    Utc::now().with_nanosecond(0).expect("zero nanoseconds is valid")
}

impl Lease {
    /// Build a fresh `running` lease stamped with the current time.
    pub fn new(task_id: &str, agent: &str, pid: u32, recipe: &str, host: &str) -> Self {
        let now = utc_now_secs();
        Self {
            task_id: task_id.to_string(),
            agent: agent.to_string(),
            pid,
            recipe: recipe.to_string(),
            started_at: now,
            heartbeat: now,
            host: host.to_string(),
            state: LeaseState::Running,
        }
    }

    /// Seconds since the supervisor started.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds()
    }

    /// Seconds since the last heartbeat update.
    pub fn heartbeat_age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.heartbeat).num_seconds()
    }

    /// Classify this lease against the local host.
    ///
    /// When several conditions hold the most severe wins:
    /// `DeadProcess` > `OverMaxRuntime` > `StaleHeartbeat`.
    pub fn classify(
        &self,
        now: DateTime<Utc>,
        heartbeat_interval_sec: u64,
        max_runtime_sec: u64,
    ) -> LeaseHealth {
        if !is_process_alive(self.pid) {
            return LeaseHealth::DeadProcess;
        }
        if self.age_seconds(now) > max_runtime_sec as i64 {
            return LeaseHealth::OverMaxRuntime;
        }
        let stale_after = (3 * heartbeat_interval_sec).max(60) as i64;
        if self.heartbeat_age_seconds(now) > stale_after {
            return LeaseHealth::StaleHeartbeat;
        }
        LeaseHealth::Healthy
    }
}

/// Check whether a process with the given pid exists on this host.
///
/// Probes with `kill(pid, 0)`. A permission-denied result means the
/// process exists under another uid, so it counts as alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease already exists for task {0}")]
    Conflict(String),

    #[error("lease does not exist for task {0}")]
    Missing(String),

    #[error("malformed lease for task {task_id}: {source}")]
    Malformed {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Manages the directory of lease files.
#[derive(Debug, Clone)]
pub struct LeaseStore {
    lease_dir: PathBuf,
}

impl LeaseStore {
    /// Open a lease store, creating the directory if needed.
    pub fn open(lease_dir: &Path) -> Result<Self, LeaseError> {
        fs::create_dir_all(lease_dir)?;
        Ok(Self {
            lease_dir: lease_dir.to_path_buf(),
        })
    }

    pub fn lease_dir(&self) -> &Path {
        &self.lease_dir
    }

    fn lease_path(&self, task_id: &str) -> Result<PathBuf, LeaseError> {
        Ok(validate::validate_lease_path(task_id, &self.lease_dir)?)
    }

    /// Atomically write `lease` to `path`: unique temp file in the same
    /// directory, fsync, then rename. Temp files are created 0600.
    fn write_atomic(&self, lease: &Lease, path: &Path) -> Result<(), LeaseError> {
        let data = serde_json::to_vec_pretty(lease).map_err(|e| LeaseError::Malformed {
            task_id: lease.task_id.clone(),
            source: e,
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("task_{}_", lease.task_id))
            .suffix(".tmp")
            .tempfile_in(&self.lease_dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| LeaseError::Io(e.error))?;
        Ok(())
    }

    /// Create a new lease. Fails with `Conflict` if one already exists.
    pub fn create(&self, lease: &Lease) -> Result<(), LeaseError> {
        let path = self.lease_path(&lease.task_id)?;
        if path.exists() {
            return Err(LeaseError::Conflict(lease.task_id.clone()));
        }
        self.write_atomic(lease, &path)
    }

    /// Overwrite an existing lease (heartbeats, terminal transitions).
    pub fn update(&self, lease: &Lease) -> Result<(), LeaseError> {
        let path = self.lease_path(&lease.task_id)?;
        if !path.exists() {
            return Err(LeaseError::Missing(lease.task_id.clone()));
        }
        self.write_atomic(lease, &path)
    }

    /// Remove the lease file. Returns false if it was already absent.
    pub fn delete(&self, task_id: &str) -> Result<bool, LeaseError> {
        let path = self.lease_path(task_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the lease for a task, if one exists.
    pub fn get(&self, task_id: &str) -> Result<Option<Lease>, LeaseError> {
        let path = self.lease_path(task_id)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let lease = serde_json::from_str(&content).map_err(|e| LeaseError::Malformed {
            task_id: task_id.to_string(),
            source: e,
        })?;
        Ok(Some(lease))
    }

    /// Enumerate all leases, skipping malformed files with a warning.
    pub fn list(&self) -> Result<Vec<Lease>, LeaseError> {
        let mut leases = Vec::new();
        for entry in fs::read_dir(&self.lease_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(task_id) = name
                .strip_prefix("task_")
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            match self.get(task_id) {
                Ok(Some(lease)) => leases.push(lease),
                Ok(None) => {}
                Err(e) => warn!(task_id, error = %e, "skipping unreadable lease"),
            }
        }
        Ok(leases)
    }

    /// Leases belonging to one agent.
    pub fn list_by_agent(&self, agent: &str) -> Result<Vec<Lease>, LeaseError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|l| l.agent == agent)
            .collect())
    }

    /// Count running leases held by one agent.
    pub fn count_by_agent(&self, agent: &str) -> Result<usize, LeaseError> {
        Ok(self
            .list()?
            .iter()
            .filter(|l| l.agent == agent && l.state == LeaseState::Running)
            .count())
    }

    /// Refresh the heartbeat timestamp. Returns false when the lease has
    /// vanished in the meantime (e.g. reclaimed by the scheduler).
    pub fn update_heartbeat(&self, task_id: &str) -> Result<bool, LeaseError> {
        let Some(mut lease) = self.get(task_id)? else {
            return Ok(false);
        };
        lease.heartbeat = utc_now_secs();
        match self.update(&lease) {
            Ok(()) => Ok(true),
            Err(LeaseError::Missing(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
