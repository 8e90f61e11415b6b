//! Scheduler configuration.
//!
//! Settings come from `TINYSCHEDULER_*` environment variables with CLI
//! flags layered on top, and are immutable once a pass starts. Relative
//! directory settings resolve against the base path.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid agent limits: {0}")]
    InvalidLimits(String),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// CLI-provided overrides, applied on top of the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_path: Option<PathBuf>,
    pub running_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub recipes_dir: Option<PathBuf>,
    pub worker_bin: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub agent_limits: Vec<String>,
    pub loop_interval_sec: Option<u64>,
    pub heartbeat_interval_sec: Option<u64>,
    pub max_runtime_sec: Option<u64>,
    pub log_level: Option<String>,
    pub dry_run: bool,
    pub disable_blocking: bool,
}

/// Process-wide scheduler configuration.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerConfig {
    pub base_path: PathBuf,
    /// Lease directory.
    pub running_dir: PathBuf,
    pub log_dir: PathBuf,
    pub recipes_dir: PathBuf,
    pub lock_file: PathBuf,
    pub agent_control_file: PathBuf,

    /// Per-agent concurrency limits.
    pub agent_limits: BTreeMap<String, u32>,

    /// Worker executable launched by each supervisor.
    pub worker_bin: PathBuf,
    /// Task service endpoint.
    pub endpoint: String,

    pub loop_interval_sec: u64,
    pub heartbeat_interval_sec: u64,
    pub max_runtime_sec: u64,

    pub dry_run: bool,
    pub disable_blocking: bool,
    pub log_level: String,

    pub hostname: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_var(name).map(PathBuf::from)
}

fn env_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(default),
    }
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_var(name)
            .map(|v| v.to_ascii_lowercase())
            .as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

/// Resolve a possibly-relative directory against the base path.
fn resolve_dir(base: &Path, value: PathBuf) -> PathBuf {
    if value.is_absolute() {
        value
    } else {
        base.join(value)
    }
}

/// The local host's name, used to stamp leases.
#[cfg(unix)]
fn default_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        if let Some(end) = buf.iter().position(|&b| b == 0) {
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    "localhost".to_string()
}

#[cfg(not(unix))]
fn default_hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl SchedulerConfig {
    /// Load configuration from the environment, then apply CLI overrides.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let base_path = overrides
            .base_path
            .clone()
            .or_else(|| env_path("TINYSCHEDULER_BASE_PATH"))
            .unwrap_or_else(|| PathBuf::from("."));

        let running_dir = overrides
            .running_dir
            .clone()
            .or_else(|| env_path("TINYSCHEDULER_RUNNING_DIR"))
            .map(|p| resolve_dir(&base_path, p))
            .unwrap_or_else(|| base_path.join("state").join("running"));

        let log_dir = overrides
            .log_dir
            .clone()
            .or_else(|| env_path("TINYSCHEDULER_LOG_DIR"))
            .map(|p| resolve_dir(&base_path, p))
            .unwrap_or_else(|| base_path.join("state").join("logs"));

        let recipes_dir = overrides
            .recipes_dir
            .clone()
            .or_else(|| env_path("TINYSCHEDULER_RECIPES_DIR"))
            .map(|p| resolve_dir(&base_path, p))
            .unwrap_or_else(|| base_path.join("recipes"));

        let lock_file = env_path("TINYSCHEDULER_LOCK_FILE")
            .map(|p| resolve_dir(&base_path, p))
            .unwrap_or_else(|| base_path.join("state").join("tinyscheduler.lock"));

        let agent_control_file = env_path("TINYSCHEDULER_AGENT_CONTROL_FILE")
            .map(|p| resolve_dir(&base_path, p))
            .unwrap_or_else(|| base_path.join("agent-control.json"));

        let worker_bin = overrides
            .worker_bin
            .clone()
            .or_else(|| env_path("TINYSCHEDULER_WORKER_BIN"))
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/taskworker"));

        let endpoint = overrides
            .endpoint
            .clone()
            .or_else(|| env_var("TINYSCHEDULER_ENDPOINT"))
            .unwrap_or_else(|| "http://localhost:3000".to_string());

        let mut agent_limits = match env_var("TINYSCHEDULER_AGENT_LIMITS") {
            Some(raw) => parse_agent_limits(&raw)?,
            None => BTreeMap::new(),
        };
        for spec in &overrides.agent_limits {
            let (agent, slots) = parse_limit_spec(spec)?;
            agent_limits.insert(agent, slots);
        }

        let loop_interval_sec = match overrides.loop_interval_sec {
            Some(v) => v,
            None => env_u64("TINYSCHEDULER_LOOP_INTERVAL_SEC", 60)?,
        };
        let heartbeat_interval_sec = match overrides.heartbeat_interval_sec {
            Some(v) => v,
            None => env_u64("TINYSCHEDULER_HEARTBEAT_SEC", 15)?,
        };
        let max_runtime_sec = match overrides.max_runtime_sec {
            Some(v) => v,
            None => env_u64("TINYSCHEDULER_MAX_RUNTIME_SEC", 3600)?,
        };

        let log_level = overrides
            .log_level
            .clone()
            .or_else(|| env_var("TINYSCHEDULER_LOG_LEVEL"))
            .unwrap_or_else(|| "info".to_string());

        let hostname = env_var("TINYSCHEDULER_HOSTNAME").unwrap_or_else(default_hostname);

        Ok(Self {
            base_path,
            running_dir,
            log_dir,
            recipes_dir,
            lock_file,
            agent_control_file,
            agent_limits,
            worker_bin,
            endpoint,
            loop_interval_sec,
            heartbeat_interval_sec,
            max_runtime_sec,
            dry_run: overrides.dry_run || env_bool("TINYSCHEDULER_DRY_RUN"),
            disable_blocking: overrides.disable_blocking
                || env_bool("TINYSCHEDULER_DISABLE_BLOCKING"),
            log_level,
            hostname,
        })
    }

    /// The concurrency limit for an agent; agents without an explicit
    /// limit default to one slot.
    pub fn limit_for(&self, agent: &str) -> u32 {
        self.agent_limits.get(agent).copied().unwrap_or(1)
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.base_path.is_dir() {
            errors.push(format!(
                "base path does not exist or is not a directory: {}",
                self.base_path.display()
            ));
        }
        if !self.recipes_dir.is_dir() {
            errors.push(format!(
                "recipes directory does not exist: {}",
                self.recipes_dir.display()
            ));
        }
        if !self.worker_bin.is_file() {
            errors.push(format!(
                "worker executable not found: {}",
                self.worker_bin.display()
            ));
        } else if !is_executable(&self.worker_bin) {
            errors.push(format!(
                "worker executable is not executable: {}",
                self.worker_bin.display()
            ));
        }
        if self.loop_interval_sec == 0 {
            errors.push("loop interval must be positive".to_string());
        }
        if self.heartbeat_interval_sec == 0 {
            errors.push("heartbeat interval must be positive".to_string());
        }
        if self.max_runtime_sec == 0 {
            errors.push("max runtime must be positive".to_string());
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            errors.push(format!(
                "task service endpoint must be http:// or https://: {}",
                self.endpoint
            ));
        }
        for agent in self.agent_limits.keys() {
            if let Err(e) = validate::validate_agent_name(agent) {
                errors.push(format!("invalid agent name in limits: {}", e));
            }
        }
        if let Err(e) = validate::validate_hostname(&self.hostname) {
            errors.push(format!("invalid hostname: {}", e));
        }

        errors
    }

    /// Create the state directories this process writes to.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        let mut dirs = vec![self.running_dir.clone(), self.log_dir.clone()];
        if let Some(parent) = self.lock_file.parent() {
            dirs.push(parent.to_path_buf());
        }
        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| ConfigError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

fn parse_limit_spec(spec: &str) -> Result<(String, u32), ConfigError> {
    let (agent, slots) = spec
        .split_once('=')
        .or_else(|| spec.split_once(':'))
        .ok_or_else(|| ConfigError::InvalidLimits(format!("expected AGENT=SLOTS: {}", spec)))?;
    let agent = agent.trim();
    if agent.is_empty() {
        return Err(ConfigError::InvalidLimits(format!(
            "empty agent name in: {}",
            spec
        )));
    }
    let slots: u32 = slots
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidLimits(format!("bad slot count in: {}", spec)))?;
    Ok((agent.to_string(), slots))
}

/// Parse agent limits from either JSON (`{"vaela": 3}`) or the simple
/// `vaela:3,oscar:2` form.
pub fn parse_agent_limits(raw: &str) -> Result<BTreeMap<String, u32>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }

    if raw.starts_with('{') {
        let parsed: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ConfigError::InvalidLimits(e.to_string()))?;
        let serde_json::Value::Object(map) = parsed else {
            return Err(ConfigError::InvalidLimits(
                "limits JSON must be an object".to_string(),
            ));
        };
        let mut limits = BTreeMap::new();
        for (agent, slots) in map {
            let slots = slots
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    ConfigError::InvalidLimits(format!(
                        "invalid slot count for agent '{}': {}",
                        agent, slots
                    ))
                })?;
            limits.insert(agent, slots);
        }
        return Ok(limits);
    }

    let mut limits = BTreeMap::new();
    for spec in raw.split(',') {
        let (agent, slots) = parse_limit_spec(spec.trim())?;
        limits.insert(agent, slots);
    }
    Ok(limits)
}

impl fmt::Display for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limits = self
            .agent_limits
            .iter()
            .map(|(agent, slots)| format!("{}={}", agent, slots))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "TinyScheduler configuration:")?;
        writeln!(f, "  base path:          {}", self.base_path.display())?;
        writeln!(f, "  lease dir:          {}", self.running_dir.display())?;
        writeln!(f, "  log dir:            {}", self.log_dir.display())?;
        writeln!(f, "  recipes dir:        {}", self.recipes_dir.display())?;
        writeln!(f, "  lock file:          {}", self.lock_file.display())?;
        writeln!(
            f,
            "  agent control file: {}",
            self.agent_control_file.display()
        )?;
        writeln!(f, "  worker executable:  {}", self.worker_bin.display())?;
        writeln!(f, "  endpoint:           {}", self.endpoint)?;
        writeln!(f, "  agent limits:       {}", limits)?;
        writeln!(f, "  loop interval:      {}s", self.loop_interval_sec)?;
        writeln!(f, "  heartbeat interval: {}s", self.heartbeat_interval_sec)?;
        writeln!(f, "  max runtime:        {}s", self.max_runtime_sec)?;
        writeln!(f, "  dry run:            {}", self.dry_run)?;
        writeln!(f, "  disable blocking:   {}", self.disable_blocking)?;
        writeln!(f, "  log level:          {}", self.log_level)?;
        write!(f, "  hostname:           {}", self.hostname)
    }
}
