//! Task blocking: filter out blocked candidates and order the rest so
//! tasks that unblock others run first.
//!
//! These are pure functions over candidate lists so the policy can be
//! tested without a scheduler. The composite spawn order is: most
//! blocking first, then highest priority, then oldest creation time.

use std::collections::HashMap;

use crate::client::Task;

/// Sentinel that sorts after any real timestamp, so tasks without a
/// `created_at` go last within a priority tier.
const CREATED_AT_SENTINEL: &str = "\u{10FFFF}";

/// Drop every task the service marked as currently blocked.
///
/// Returns the surviving tasks (original order preserved) and the number
/// removed.
pub fn filter_blocked(tasks: Vec<Task>) -> (Vec<Task>, usize) {
    let before = tasks.len();
    let unblocked: Vec<Task> = tasks
        .into_iter()
        .filter(|t| !t.is_currently_blocked)
        .collect();
    let blocked = before - unblocked.len();
    (unblocked, blocked)
}

/// Count, for each task id in `tasks`, how many other candidates it
/// blocks. Blockers that are not themselves in the candidate list
/// contribute nothing.
pub fn count_blockers(tasks: &[Task]) -> HashMap<String, usize> {
    let ids: std::collections::HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for task in tasks {
        if let Some(blocker) = &task.blocked_by_task_id {
            if ids.contains(blocker.as_str()) {
                *counts.entry(blocker.clone()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Order tasks for spawning: blocker count descending, then priority
/// descending, then `created_at` ascending (missing timestamps last).
/// The sort is stable, so service order breaks remaining ties.
pub fn sort_for_spawning(mut tasks: Vec<Task>, blocker_counts: &HashMap<String, usize>) -> Vec<Task> {
    tasks.sort_by(|a, b| {
        let a_blockers = blocker_counts.get(&a.id).copied().unwrap_or(0);
        let b_blockers = blocker_counts.get(&b.id).copied().unwrap_or(0);
        b_blockers
            .cmp(&a_blockers)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| {
                let a_created = a.created_at.as_deref().unwrap_or(CREATED_AT_SENTINEL);
                let b_created = b.created_at.as_deref().unwrap_or(CREATED_AT_SENTINEL);
                a_created.cmp(b_created)
            })
    });
    tasks
}

/// Full spawn-order planning for a candidate list.
///
/// With `disable_blocking` set this is an exact pass-through: no
/// filtering, no blocker counting, no reordering.
pub fn plan_spawn_order(tasks: Vec<Task>, disable_blocking: bool) -> (Vec<Task>, usize) {
    if disable_blocking {
        return (tasks, 0);
    }
    // Blocker counts come from the full candidate list: a blocked task
    // still testifies to who is blocking it.
    let counts = count_blockers(&tasks);
    let (unblocked, blocked) = filter_blocked(tasks);
    (sort_for_spawning(unblocked, &counts), blocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            ..Task::default()
        }
    }

    fn task_full(
        id: &str,
        priority: i64,
        blocked_by: Option<&str>,
        blocked: bool,
        created_at: Option<&str>,
    ) -> Task {
        Task {
            id: id.to_string(),
            priority,
            blocked_by_task_id: blocked_by.map(|s| s.to_string()),
            is_currently_blocked: blocked,
            created_at: created_at.map(|s| s.to_string()),
            ..Task::default()
        }
    }

    #[test]
    fn test_filter_empty() {
        let (tasks, blocked) = filter_blocked(vec![]);
        assert!(tasks.is_empty());
        assert_eq!(blocked, 0);
    }

    #[test]
    fn test_filter_mixed() {
        let tasks = vec![
            task_full("1", 0, None, false, None),
            task_full("2", 0, None, true, None),
            task_full("3", 0, None, false, None),
        ];
        let (unblocked, blocked) = filter_blocked(tasks);
        assert_eq!(blocked, 1);
        let ids: Vec<&str> = unblocked.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn test_filter_all_blocked() {
        let tasks = vec![
            task_full("1", 0, None, true, None),
            task_full("2", 0, None, true, None),
        ];
        let (unblocked, blocked) = filter_blocked(tasks);
        assert!(unblocked.is_empty());
        assert_eq!(blocked, 2);
    }

    #[test]
    fn test_count_no_relationships() {
        let tasks = vec![task("1"), task("2")];
        assert!(count_blockers(&tasks).is_empty());
    }

    #[test]
    fn test_count_multiple_blocked_by_same() {
        let tasks = vec![
            task("1"),
            task_full("2", 0, Some("1"), false, None),
            task_full("3", 0, Some("1"), false, None),
        ];
        let counts = count_blockers(&tasks);
        assert_eq!(counts.get("1"), Some(&2));
        assert_eq!(counts.len(), 1);
    }

    #[test]
    fn test_count_chain() {
        let tasks = vec![
            task("1"),
            task_full("2", 0, Some("1"), false, None),
            task_full("3", 0, Some("2"), false, None),
        ];
        let counts = count_blockers(&tasks);
        assert_eq!(counts.get("1"), Some(&1));
        assert_eq!(counts.get("2"), Some(&1));
    }

    #[test]
    fn test_count_ignores_external_blockers() {
        let tasks = vec![task("1"), task_full("2", 0, Some("999"), false, None)];
        assert!(count_blockers(&tasks).is_empty());
    }

    #[test]
    fn test_sort_by_blocker_count() {
        let tasks = vec![task("1"), task("2"), task("3")];
        let mut counts = HashMap::new();
        counts.insert("2".to_string(), 3);
        counts.insert("1".to_string(), 1);
        counts.insert("3".to_string(), 2);

        let sorted = sort_for_spawning(tasks, &counts);
        let ids: Vec<&str> = sorted.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
    }

    #[test]
    fn test_sort_by_priority() {
        let tasks = vec![
            task_full("1", 1, None, false, None),
            task_full("2", 10, None, false, None),
            task_full("3", 5, None, false, None),
        ];
        let sorted = sort_for_spawning(tasks, &HashMap::new());
        let ids: Vec<&str> = sorted.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
    }

    #[test]
    fn test_sort_by_creation_time_fifo() {
        let tasks = vec![
            task_full("1", 5, None, false, Some("2026-01-26T12:00:00")),
            task_full("2", 5, None, false, Some("2026-01-26T10:00:00")),
            task_full("3", 5, None, false, Some("2026-01-26T11:00:00")),
        ];
        let sorted = sort_for_spawning(tasks, &HashMap::new());
        let ids: Vec<&str> = sorted.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
    }

    #[test]
    fn test_sort_multilevel() {
        let tasks = vec![
            task_full("1", 5, None, false, Some("2026-01-26T12:00:00")),
            task_full("2", 10, None, false, Some("2026-01-26T10:00:00")),
            task_full("3", 10, None, false, Some("2026-01-26T09:00:00")),
            task_full("4", 5, None, false, Some("2026-01-26T11:00:00")),
        ];
        let mut counts = HashMap::new();
        counts.insert("1".to_string(), 2);

        let sorted = sort_for_spawning(tasks, &counts);
        let ids: Vec<&str> = sorted.iter().map(|t| t.id.as_str()).collect();
        // Blocker first, then priority, then age within a tier.
        assert_eq!(ids, vec!["1", "3", "2", "4"]);
    }

    #[test]
    fn test_sort_missing_created_at_goes_last() {
        let tasks = vec![
            task_full("1", 5, None, false, None),
            task_full("2", 5, None, false, Some("2026-01-26T10:00:00")),
        ];
        let sorted = sort_for_spawning(tasks, &HashMap::new());
        assert_eq!(sorted[0].id, "2");
        assert_eq!(sorted[1].id, "1");
    }

    #[test]
    fn test_sort_key_monotonic() {
        let tasks = vec![
            task_full("a", 3, None, false, Some("2026-01-01T00:00:00")),
            task_full("b", 7, None, false, None),
            task_full("c", 3, None, false, Some("2025-06-01T00:00:00")),
            task_full("d", 0, Some("a"), false, None),
        ];
        let counts = count_blockers(&tasks);
        let sorted = sort_for_spawning(tasks, &counts);

        let key = |t: &Task| {
            (
                std::cmp::Reverse(counts.get(&t.id).copied().unwrap_or(0)),
                std::cmp::Reverse(t.priority),
                t.created_at.clone().unwrap_or_else(|| "\u{10FFFF}".to_string()),
            )
        };
        for pair in sorted.windows(2) {
            assert!(key(&pair[0]) <= key(&pair[1]));
        }
    }

    #[test]
    fn test_plan_spawn_order_counts_blockers_before_filtering() {
        // B is blocked but still marks A as a blocker, so A outranks C.
        let tasks = vec![
            task_full("A", 0, None, false, None),
            task_full("B", 10, Some("A"), true, None),
            task_full("C", 5, None, false, None),
        ];
        let (ordered, blocked) = plan_spawn_order(tasks, false);
        assert_eq!(blocked, 1);
        let ids: Vec<&str> = ordered.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }

    #[test]
    fn test_plan_spawn_order_kill_switch_is_passthrough() {
        let tasks = vec![
            task_full("1", 0, None, false, None),
            task_full("2", 10, Some("1"), true, None),
            task_full("3", 5, None, false, None),
        ];
        let original: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let (ordered, blocked) = plan_spawn_order(tasks, true);
        assert_eq!(blocked, 0);
        let ids: Vec<String> = ordered.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, original);
    }
}
