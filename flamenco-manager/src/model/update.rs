//! The task-update envelope (base spec §3 "Task Update").

use serde::{Deserialize, Serialize};

use crate::ids::{EnvelopeId, JobId, TaskId, WorkerId};
use crate::model::task::TaskStatus;

/// Number of trailing newline-separated lines kept in `log_tail` (base spec
/// §3, §4.2 step 3).
pub const LOG_TAIL_LINES: usize = 10;

/// One update, either proposed by a worker or synthesized locally by the
/// Manager (cancellation, sign-off requeue, blacklist hard-fail, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: EnvelopeId,
    pub task_id: TaskId,
    /// Carried alongside the task id purely to resolve the on-disk log path
    /// without a cache lookup; `JobId::UNKNOWN` is the "job unknown" sentinel
    /// (base spec §4.2 step 6, §4.5).
    pub job_id: JobId,

    pub new_status: Option<TaskStatus>,
    pub activity: Option<String>,
    pub progress_percent: Option<u8>,
    pub current_command_idx: Option<u32>,
    pub command_progress: Option<u8>,

    /// Full log chunk as received from the worker. Cleared (moved to
    /// `log_tail`) once queued (base spec §4.2 step 3).
    pub log: Option<String>,
    /// Last [`LOG_TAIL_LINES`] newline-separated lines of `log`, newline
    /// terminated.
    pub log_tail: Option<String>,

    pub failed_by_workers: Vec<WorkerId>,
    pub worker_id: Option<WorkerId>,

    /// Monotone-per-process sequence number, used purely to order queued
    /// updates; not a wall-clock timestamp (base spec §4.2 step 1, §9).
    pub received_on_manager: u64,

    /// Synthetic updates generated inside the Manager never get pushed
    /// upstream, but otherwise mutate local state exactly like a worker
    /// update (base spec GLOSSARY "Manager-local update").
    pub manager_local: bool,
}

impl TaskUpdate {
    pub fn from_worker(task_id: TaskId, job_id: JobId, worker_id: WorkerId) -> Self {
        TaskUpdate {
            id: EnvelopeId::new(),
            task_id,
            job_id,
            new_status: None,
            activity: None,
            progress_percent: None,
            current_command_idx: None,
            command_progress: None,
            log: None,
            log_tail: None,
            failed_by_workers: Vec::new(),
            worker_id: Some(worker_id),
            received_on_manager: 0,
            manager_local: false,
        }
    }

    pub fn manager_local(task_id: TaskId, job_id: JobId, status: TaskStatus) -> Self {
        TaskUpdate {
            id: EnvelopeId::new(),
            task_id,
            job_id,
            new_status: Some(status),
            activity: None,
            progress_percent: None,
            current_command_idx: None,
            command_progress: None,
            log: None,
            log_tail: None,
            failed_by_workers: Vec::new(),
            worker_id: None,
            received_on_manager: 0,
            manager_local: true,
        }
    }

    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn with_log_line(mut self, line: impl Into<String>) -> Self {
        self.log = Some(format!("{}\n", line.into()));
        self
    }
}

/// Truncate `log` to its last [`LOG_TAIL_LINES`] newline-separated segments,
/// newline terminated (base spec §4.2 step 3, §8 scenario 5).
pub fn tail_lines(log: &str) -> String {
    let trimmed = log.strip_suffix('\n').unwrap_or(log);
    if trimmed.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = trimmed.split('\n').collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    let mut tail = lines[start..].join("\n");
    tail.push('\n');
    tail
}
