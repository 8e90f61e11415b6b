//! Shared test doubles: an in-process task service and a recording
//! supervisor spawner.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tinyscheduler::client::{Task, TaskService, UpdateState};
use tinyscheduler::lease::{Lease, LeaseStore};
use tinyscheduler::scheduler::{SpawnRequest, SupervisorSpawner};

/// In-memory task service. `assign` moves the task out of the unassigned
/// pool so consecutive passes see the service state advance.
#[derive(Default)]
pub struct MockTaskService {
    pub idle_by_agent: Mutex<HashMap<String, Vec<Task>>>,
    pub unassigned_by_queue: Mutex<HashMap<String, Vec<Task>>>,
    pub assignments: Mutex<Vec<(String, String)>>,
    pub state_updates: Mutex<Vec<(String, &'static str, Value)>>,
    /// When false, `assign` refuses (simulates a degraded remote write).
    pub assign_ok: bool,
}

impl MockTaskService {
    pub fn new() -> Self {
        Self {
            assign_ok: true,
            ..Self::default()
        }
    }

    pub fn with_unassigned(self, queue: &str, tasks: Vec<Task>) -> Self {
        self.unassigned_by_queue
            .lock()
            .unwrap()
            .insert(queue.to_string(), tasks);
        self
    }

    pub fn with_idle(self, agent: &str, tasks: Vec<Task>) -> Self {
        self.idle_by_agent
            .lock()
            .unwrap()
            .insert(agent.to_string(), tasks);
        self
    }

    pub fn updates_for(&self, task_id: &str) -> Vec<(String, &'static str, Value)> {
        self.state_updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == task_id)
            .cloned()
            .collect()
    }
}

impl TaskService for MockTaskService {
    fn list_idle_tasks(&self, agent: &str, _limit: usize) -> Vec<Task> {
        self.idle_by_agent
            .lock()
            .unwrap()
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }

    // The limit is advisory; the reconciler enforces slot budgets itself.
    fn get_unassigned_in_queue(&self, queue: &str, _limit: usize) -> Vec<Task> {
        self.unassigned_by_queue
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    fn assign(&self, task_id: &str, agent: &str) -> bool {
        if !self.assign_ok {
            return false;
        }
        self.assignments
            .lock()
            .unwrap()
            .push((task_id.to_string(), agent.to_string()));
        for tasks in self.unassigned_by_queue.lock().unwrap().values_mut() {
            tasks.retain(|t| t.id != task_id);
        }
        true
    }

    fn update_state(&self, task_id: &str, state: UpdateState, metadata: Value) -> bool {
        self.state_updates
            .lock()
            .unwrap()
            .push((task_id.to_string(), state.as_str(), metadata));
        true
    }

    fn get_task(&self, _task_id: &str) -> Option<Task> {
        None
    }
}

/// Records spawn requests. With a lease store attached it also writes the
/// lease a real supervisor would create on startup, so slot accounting in
/// later passes sees the launch.
pub struct RecordingSpawner {
    pub requests: Mutex<Vec<SpawnRequest>>,
    pub store: Option<LeaseStore>,
    pub fail: bool,
}

impl RecordingSpawner {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            store: None,
            fail: false,
        }
    }

    pub fn with_store(store: LeaseStore) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            store: Some(store),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            store: None,
            fail: true,
        }
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl SupervisorSpawner for RecordingSpawner {
    fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<u32> {
        if self.fail {
            anyhow::bail!("spawn refused by test double");
        }
        self.requests.lock().unwrap().push(request.clone());
        if let Some(store) = &self.store {
            let recipe = request
                .recipe_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let lease = Lease::new(
                &request.task_id,
                &request.agent,
                std::process::id(),
                &recipe,
                "test-host",
            );
            store.create(&lease)?;
        }
        Ok(std::process::id())
    }
}

/// Minimal idle task for scheduler scenarios.
pub fn idle_task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        ..Task::default()
    }
}

/// Task with the blocking-relevant fields set.
pub fn blocking_task(
    id: &str,
    priority: i64,
    blocked_by: Option<&str>,
    is_blocked: bool,
) -> Task {
    Task {
        id: id.to_string(),
        priority,
        blocked_by_task_id: blocked_by.map(|s| s.to_string()),
        is_currently_blocked: is_blocked,
        ..Task::default()
    }
}
