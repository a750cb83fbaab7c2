//! Manager configuration.
//!
//! Mirrors `examples/original_source/src/flamenco-manager/flamenco/settings.go`:
//! a flat struct carrying every tunable, constructed with sensible defaults and
//! then overridden by whatever config-loading collaborator runs in front of
//! this crate (out of scope here, see SPEC_FULL.md §A.3/§C).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::worker::WorkerStatus;

/// Per-platform variable values, keyed by variable name then platform name.
pub type VariableTable = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Address the worker- and operator-facing HTTP server binds to.
    pub listen: String,

    /// Base URL this Manager is reachable at by its workers, used when
    /// constructing links back to itself. Not otherwise interpreted here.
    pub own_url: String,

    /// Base URL of the upstream coordinator.
    pub flamenco_url: String,

    pub manager_id: String,
    pub manager_secret: String,

    /// Root directory task logs are written under (base spec §6 on-disk layout).
    pub task_logs_path: String,

    /// Minimum gap between scheduler-triggered upstream kicks when the queue
    /// looks empty. Negative means "never kick on demand" (base spec §4.1
    /// step 3b).
    pub download_task_recheck_throttle: i64,

    pub task_update_push_max_interval: Duration,
    pub task_update_push_max_count: usize,
    pub cancel_task_fetch_interval: Duration,

    pub active_task_timeout_interval: Duration,
    pub active_worker_timeout_interval: Duration,

    /// Failures (or soft-fails) per (worker, job, task-type) before the
    /// triple is blacklisted (base spec §4.2 worker-failure handling).
    pub blacklist_threshold: u32,

    /// Number of entries in `failed_by_workers` at which a task is hard-failed
    /// outright regardless of remaining candidate workers.
    pub task_fail_after_soft_fail_count: u32,

    /// Worker idle age after which the remover deletes it. Zero disables the
    /// remover (base spec §4.6).
    pub worker_cleanup_max_age: Duration,
    pub worker_cleanup_status: Vec<WorkerStatus>,

    /// variable name -> platform -> value, applied by `varrepl` (base spec
    /// §4.1 step 5, §9 Design Notes).
    pub variables: VariableTable,
    pub path_replacement: VariableTable,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            listen: ":8083".to_string(),
            own_url: String::new(),
            flamenco_url: String::new(),
            manager_id: String::new(),
            manager_secret: String::new(),
            task_logs_path: "task-logs".to_string(),

            download_task_recheck_throttle: 10,

            task_update_push_max_interval: Duration::from_secs(30),
            task_update_push_max_count: 10,
            cancel_task_fetch_interval: Duration::from_secs(10),

            active_task_timeout_interval: Duration::from_secs(60),
            active_worker_timeout_interval: Duration::from_secs(15 * 60),

            blacklist_threshold: 3,
            task_fail_after_soft_fail_count: 3,

            worker_cleanup_max_age: Duration::ZERO,
            worker_cleanup_status: Vec::new(),

            variables: HashMap::new(),
            path_replacement: HashMap::new(),
        }
    }
}

impl ManagerConfig {
    /// True when the worker remover (§4.6) should run at all.
    pub fn worker_cleanup_enabled(&self) -> bool {
        !self.worker_cleanup_max_age.is_zero() && !self.worker_cleanup_status.is_empty()
    }

    /// Variables re-keyed by platform, the shape `varrepl` actually consumes;
    /// mirrors `transposeVariableMatrix` in settings.go.
    pub fn variables_by_platform(&self) -> VariableTable {
        transpose(&self.variables)
    }

    pub fn path_replacement_by_platform(&self) -> VariableTable {
        transpose(&self.path_replacement)
    }

    /// Parses `flamenco_url`, the upstream coordinator base URL every real
    /// `UpstreamClient` implementation needs. Out-of-scope collaborator
    /// (base spec §1), but validating the setting that feeds it belongs
    /// here with the rest of config handling.
    pub fn flamenco_url(&self) -> Result<url::Url, url::ParseError> {
        url::Url::parse(&self.flamenco_url)
    }
}

fn transpose(table: &VariableTable) -> VariableTable {
    let mut out: VariableTable = HashMap::new();
    for (varname, per_platform) in table {
        for (platform, value) in per_platform {
            out.entry(platform.clone())
                .or_default()
                .insert(varname.clone(), value.clone());
        }
    }
    out
}
