//! Dashboard summary counts.

use chrono::NaiveDate;
use taskflow_proto::task::{Priority, Task};

/// Counts shown on the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DashboardStats {
    /// All tasks.
    pub total: usize,
    /// Completed tasks.
    pub completed: usize,
    /// Pending tasks.
    pub pending: usize,
    /// Pending tasks whose due date has passed.
    pub overdue: usize,
    /// Pending high-priority tasks.
    pub high_priority: usize,
    /// Tasks per priority: low, medium, high.
    pub by_priority: [usize; 3],
}

impl DashboardStats {
    /// Computes the counts for `tasks` as of `today`.
    #[must_use]
    pub fn from_tasks(tasks: &[Task], today: NaiveDate) -> Self {
        let mut stats = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            if task.completed {
                stats.completed += 1;
            } else {
                stats.pending += 1;
                if task.priority == Priority::High {
                    stats.high_priority += 1;
                }
            }
            if task.is_overdue(today) {
                stats.overdue += 1;
            }
            let slot = match task.priority {
                Priority::Low => 0,
                Priority::Medium => 1,
                Priority::High => 2,
            };
            stats.by_priority[slot] += 1;
        }
        stats
    }

    /// Completed share in whole percent; zero for an empty list.
    #[must_use]
    pub fn completion_percent(&self) -> usize {
        if self.total == 0 {
            0
        } else {
            self.completed * 100 / self.total
        }
    }
}
