//! Storage collaborator boundary.
//!
//! The embedded database is explicitly out of scope (base spec §1); this
//! trait is the seam SPEC_FULL.md §C calls for — narrow enough that a real
//! Mongo-equivalent backend could implement it, and with an in-memory
//! implementation ([`memory::MemoryStore`]) good enough to run the core
//! logic and its tests. Mutating methods are named after what they do, not
//! after Mongo verbs, but `patch_task`/`patch_worker` keep the `$set`/`$push`
//! namespace split the original `bson.M` update documents used (base spec
//! §4.2 step 5, §4.3), since that shape is what callers need to express
//! "set these fields, and also push onto this array."

pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::ids::{EnvelopeId, JobId, TaskId, WorkerId};
use crate::model::task::Task;
use crate::model::update::TaskUpdate;
use crate::model::worker::{Worker, WorkerStatus};
use crate::model::BlacklistEntry;

/// A mechanical `$set`/`$push` update document, applied blindly by the
/// store. Transition validity and business rules are decided by the caller
/// *before* building the patch (base spec §4.2 step 5 separates "compute
/// the patch" from "apply the patch").
#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    pub set: HashMap<String, Value>,
    pub push: HashMap<String, Value>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn push(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.push.insert(field.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.push.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct WorkerPatch {
    pub set: HashMap<String, Value>,
    pub unset: Vec<String>,
}

impl WorkerPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn unset(mut self, field: &str) -> Self {
        self.unset.push(field.to_string());
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // ---- Tasks (`flamenco_tasks`) -----------------------------------

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Upstream authoritative copy overwrites the local cache wholesale
    /// (base spec §4.1 step 3c "the upstream overwrites the local copy").
    async fn put_task(&self, task: Task) -> Result<()>;

    /// The scheduler's atomic primitive (base spec §4.1 step 3a, §9 "find
    /// and modify with sort"): claim one runnable task of a type in
    /// `task_types`, whose `(job, task_type)` is not in `excluded`, ordered
    /// by descending priority, and mark it `active`.
    async fn claim_runnable_task(
        &self,
        task_types: &[String],
        excluded: &[(JobId, String)],
    ) -> Result<Option<Task>>;

    /// Apply a patch to a cached task. Returns `Ok(None)` if the task is
    /// unknown — "not-found is logged, not fatal" (base spec §4.2 step 7,
    /// §7).
    async fn patch_task(&self, id: TaskId, patch: TaskPatch) -> Result<Option<Task>>;

    async fn tasks_assigned_to(&self, worker: WorkerId) -> Result<Vec<Task>>;

    /// All tasks of a (job, task_type) assigned to `worker` that have not
    /// yet been hard-failed, used by the blacklist-exhaustion sweep (base
    /// spec §4.2 worker-failure handling, last bullet).
    async fn tasks_not_hard_failed(
        &self,
        worker: WorkerId,
        job: JobId,
        task_type: &str,
    ) -> Result<Vec<Task>>;

    // ---- Workers (`flamenco_workers`) -------------------------------

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>>;
    async fn put_worker(&self, worker: Worker) -> Result<()>;
    async fn patch_worker(&self, id: WorkerId, patch: WorkerPatch) -> Result<Option<Worker>>;
    async fn delete_worker(&self, id: WorkerId) -> Result<()>;

    async fn workers_supporting(&self, task_type: &str) -> Result<Vec<Worker>>;

    async fn workers_for_cleanup(
        &self,
        statuses: &[WorkerStatus],
        last_activity_before: i64,
    ) -> Result<Vec<Worker>>;

    // ---- Task update queue (`task_update_queue`) --------------------

    async fn enqueue(&self, envelope: TaskUpdate) -> Result<EnvelopeId>;
    async fn queue_len(&self) -> Result<usize>;

    /// Up to `max` envelopes, oldest `received_on_manager` first (base spec
    /// §4.4 step 3, §5 ordering guarantee 2).
    async fn queue_batch(&self, max: usize) -> Result<Vec<TaskUpdate>>;
    async fn dequeue(&self, ids: &[EnvelopeId]) -> Result<()>;

    // ---- Blacklist collection ----------------------------------------

    async fn blacklist_add(&self, entry: BlacklistEntry) -> Result<()>;
    async fn is_blacklisted(&self, worker: WorkerId, job: JobId, task_type: &str) -> Result<bool>;

    /// Every `(job, task_type)` this worker is currently sidelined for,
    /// consulted by the scheduler to exclude tasks up front (base spec
    /// §4.1 step 3a).
    async fn blacklisted_job_task_types_for(&self, worker: WorkerId) -> Result<Vec<(JobId, String)>>;

    /// Failures-or-soft-fails recorded for this (worker, job, task_type),
    /// including the one just applied; the caller increments before
    /// checking against `BlacklistThreshold` (base spec §4.2, last bullet).
    async fn record_failure(&self, worker: WorkerId, job: JobId, task_type: &str) -> Result<u32>;
}
