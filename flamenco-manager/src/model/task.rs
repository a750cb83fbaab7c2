//! The cached task document (base spec §3 "Task").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{JobId, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    ClaimedByManager,
    Active,
    Completed,
    Failed,
    Canceled,
    CancelRequested,
    SoftFailed,
}

impl TaskStatus {
    pub const fn is_runnable(self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::ClaimedByManager | TaskStatus::Active
        )
    }

    /// The status-transition rule from base spec §3: from `cancel-requested`
    /// only `canceled | failed | completed` are accepted; from anywhere else
    /// any status is a valid destination. This is the Open Question the base
    /// spec flags about backward transitions (`completed -> active`) being
    /// technically legal: preserved here deliberately, see DESIGN.md.
    pub const fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::CancelRequested => matches!(
                next,
                TaskStatus::Canceled | TaskStatus::Failed | TaskStatus::Completed
            ),
            _ => true,
        }
    }
}

/// A single command setting value. Structural substitution target for
/// `varrepl`: only the `Str` variant is ever rewritten (base spec §9
/// "Reflection-driven variable substitution").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Str(String),
    Number(f64),
    Bool(bool),
    List(Vec<SettingValue>),
    Map(HashMap<String, SettingValue>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub settings: HashMap<String, SettingValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job: JobId,
    pub worker_id: Option<WorkerId>,
    pub commands: Vec<Command>,
    pub task_type: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub activity: String,
    pub progress_percent: u8,
    pub current_command_idx: u32,
    pub command_progress: u8,
    /// The task's own accumulated log field, distinct from the on-disk log
    /// file the update queue maintains (base spec §4.2 step 5).
    pub log: String,
    pub failed_by_workers: Vec<WorkerId>,
    pub last_worker_ping: Option<i64>,
    pub last_updated: i64,
    pub etag: String,
}

impl Task {
    pub fn new(job: JobId, task_type: impl Into<String>, priority: i32) -> Self {
        Task {
            id: TaskId::new(),
            job,
            worker_id: None,
            commands: Vec::new(),
            task_type: task_type.into(),
            priority,
            status: TaskStatus::Queued,
            activity: String::new(),
            progress_percent: 0,
            current_command_idx: 0,
            command_progress: 0,
            log: String::new(),
            failed_by_workers: Vec::new(),
            last_worker_ping: None,
            last_updated: proxmox_time::epoch_i64(),
            etag: TaskId::new().to_string(),
        }
    }

    pub fn touch_etag(&mut self) {
        self.etag = TaskId::new().to_string();
    }
}
