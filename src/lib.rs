pub mod blocking;
pub mod client;
pub mod config;
pub mod lease;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod validate;

pub use client::{Task, TaskService, UpdateState};
pub use config::SchedulerConfig;
pub use lease::{Lease, LeaseHealth, LeaseState, LeaseStore};
pub use registry::AgentRegistry;
pub use scheduler::{ReconcileStats, Scheduler};

/// Format a duration in seconds to a human-readable string.
///
/// When `compact` is false, includes the next smaller unit if non-zero
/// (e.g., "1h 5m", "30s"). When `compact` is true, shows only the
/// largest unit (e.g., "1h", "5m").
pub fn format_duration(secs: i64, compact: bool) -> String {
    if secs < 60 {
        return format!("{}s", secs);
    }
    if secs < 3600 {
        let mins = secs / 60;
        let s = secs % 60;
        if compact || s == 0 {
            return format!("{}m", mins);
        }
        return format!("{}m {}s", mins, s);
    }
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    if compact || mins == 0 {
        return format!("{}h", hours);
    }
    format!("{}h {}m", hours, mins)
}
