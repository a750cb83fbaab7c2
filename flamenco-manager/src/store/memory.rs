//! In-memory [`Store`] implementation.
//!
//! Good enough to drive the scheduler, update queue, pusher and remover
//! against in a single process and in tests; a production deployment would
//! swap this for a real database-backed implementation of the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::ids::{EnvelopeId, JobId, TaskId, WorkerId};
use crate::model::task::{Task, TaskStatus};
use crate::model::update::TaskUpdate;
use crate::model::worker::{Worker, WorkerStatus};
use crate::model::BlacklistEntry;

use super::{Store, TaskPatch, WorkerPatch};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    workers: HashMap<WorkerId, Worker>,
    queue: Vec<(EnvelopeId, TaskUpdate)>,
    blacklist: std::collections::HashSet<BlacklistEntry>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store mutex poisoned")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_task_patch(task: &mut Task, patch: &TaskPatch) -> Result<()> {
    for (field, value) in &patch.set {
        apply_task_set(task, field, value)?;
    }
    for (field, value) in &patch.push {
        apply_task_push(task, field, value)?;
    }
    task.last_updated = proxmox_time::epoch_i64();
    task.touch_etag();
    Ok(())
}

fn apply_task_set(task: &mut Task, field: &str, value: &Value) -> Result<()> {
    match field {
        "status" => task.status = serde_json::from_value(value.clone())?,
        "activity" => task.activity = serde_json::from_value(value.clone())?,
        "log" => task.log = serde_json::from_value(value.clone())?,
        "worker_id" => task.worker_id = serde_json::from_value(value.clone())?,
        "last_worker_ping" => task.last_worker_ping = serde_json::from_value(value.clone())?,
        "progress_percent" => task.progress_percent = serde_json::from_value(value.clone())?,
        "current_command_idx" => task.current_command_idx = serde_json::from_value(value.clone())?,
        "command_progress" => task.command_progress = serde_json::from_value(value.clone())?,
        other => anyhow::bail!("unknown task field in patch: {other}"),
    }
    Ok(())
}

fn apply_task_push(task: &mut Task, field: &str, value: &Value) -> Result<()> {
    match field {
        "failed_by_workers" => {
            let worker: WorkerId = serde_json::from_value(value.clone())?;
            task.failed_by_workers.push(worker);
        }
        other => anyhow::bail!("unknown task push field in patch: {other}"),
    }
    Ok(())
}

fn apply_worker_patch(worker: &mut Worker, patch: &WorkerPatch) -> Result<()> {
    for (field, value) in &patch.set {
        apply_worker_set(worker, field, value)?;
    }
    for field in &patch.unset {
        apply_worker_unset(worker, field)?;
    }
    Ok(())
}

fn apply_worker_set(worker: &mut Worker, field: &str, value: &Value) -> Result<()> {
    match field {
        "status" => worker.status = serde_json::from_value(value.clone())?,
        "address" => worker.address = serde_json::from_value(value.clone())?,
        "software" => worker.software = serde_json::from_value(value.clone())?,
        "last_activity" => worker.last_activity = serde_json::from_value(value.clone())?,
        "nickname" => worker.nickname = serde_json::from_value(value.clone())?,
        "platform" => worker.platform = serde_json::from_value(value.clone())?,
        "supported_task_types" => worker.supported_task_types = serde_json::from_value(value.clone())?,
        "current_task" => worker.current_task = serde_json::from_value(value.clone())?,
        "current_task_status" => worker.current_task_status = serde_json::from_value(value.clone())?,
        "current_task_updated" => worker.current_task_updated = serde_json::from_value(value.clone())?,
        other => anyhow::bail!("unknown worker field in patch: {other}"),
    }
    Ok(())
}

fn apply_worker_unset(worker: &mut Worker, field: &str) -> Result<()> {
    match field {
        "current_task" => worker.current_task = None,
        "current_task_status" => worker.current_task_status = None,
        "current_task_updated" => worker.current_task_updated = None,
        "nickname" => worker.nickname = None,
        other => anyhow::bail!("unknown worker field in unset: {other}"),
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.lock().tasks.get(&id).cloned())
    }

    async fn put_task(&self, task: Task) -> Result<()> {
        self.lock().tasks.insert(task.id, task);
        Ok(())
    }

    async fn claim_runnable_task(
        &self,
        task_types: &[String],
        excluded: &[(JobId, String)],
    ) -> Result<Option<Task>> {
        let mut inner = self.lock();
        let winner_id = inner
            .tasks
            .values()
            .filter(|t| t.status.is_runnable())
            .filter(|t| task_types.iter().any(|tt| tt == &t.task_type))
            .filter(|t| {
                !excluded
                    .iter()
                    .any(|(job, tt)| *job == t.job && tt == &t.task_type)
            })
            .max_by_key(|t| t.priority)
            .map(|t| t.id);

        let Some(id) = winner_id else {
            return Ok(None);
        };
        let task = inner.tasks.get_mut(&id).expect("just looked this up");
        task.status = TaskStatus::Active;
        task.last_updated = proxmox_time::epoch_i64();
        task.touch_etag();
        Ok(Some(task.clone()))
    }

    async fn patch_task(&self, id: TaskId, patch: TaskPatch) -> Result<Option<Task>> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(None);
        };
        apply_task_patch(task, &patch).context("applying task patch")?;
        Ok(Some(task.clone()))
    }

    async fn tasks_assigned_to(&self, worker: WorkerId) -> Result<Vec<Task>> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| t.worker_id == Some(worker))
            .cloned()
            .collect())
    }

    async fn tasks_not_hard_failed(
        &self,
        worker: WorkerId,
        job: JobId,
        task_type: &str,
    ) -> Result<Vec<Task>> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| t.job == job && t.task_type == task_type)
            .filter(|t| t.failed_by_workers.contains(&worker))
            .filter(|t| t.status != TaskStatus::Failed)
            .cloned()
            .collect())
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>> {
        Ok(self.lock().workers.get(&id).cloned())
    }

    async fn put_worker(&self, worker: Worker) -> Result<()> {
        self.lock().workers.insert(worker.id, worker);
        Ok(())
    }

    async fn patch_worker(&self, id: WorkerId, patch: WorkerPatch) -> Result<Option<Worker>> {
        let mut inner = self.lock();
        let Some(worker) = inner.workers.get_mut(&id) else {
            return Ok(None);
        };
        apply_worker_patch(worker, &patch).context("applying worker patch")?;
        Ok(Some(worker.clone()))
    }

    async fn delete_worker(&self, id: WorkerId) -> Result<()> {
        self.lock().workers.remove(&id);
        Ok(())
    }

    async fn workers_supporting(&self, task_type: &str) -> Result<Vec<Worker>> {
        Ok(self
            .lock()
            .workers
            .values()
            .filter(|w| w.supports(task_type))
            .cloned()
            .collect())
    }

    async fn workers_for_cleanup(
        &self,
        statuses: &[WorkerStatus],
        last_activity_before: i64,
    ) -> Result<Vec<Worker>> {
        Ok(self
            .lock()
            .workers
            .values()
            .filter(|w| statuses.contains(&w.status))
            .filter(|w| w.last_activity < last_activity_before)
            .cloned()
            .collect())
    }

    async fn enqueue(&self, envelope: TaskUpdate) -> Result<EnvelopeId> {
        let id = envelope.id;
        self.lock().queue.push((id, envelope));
        Ok(id)
    }

    async fn queue_len(&self) -> Result<usize> {
        Ok(self.lock().queue.len())
    }

    async fn queue_batch(&self, max: usize) -> Result<Vec<TaskUpdate>> {
        Ok(self
            .lock()
            .queue
            .iter()
            .take(max)
            .map(|(_, envelope)| envelope.clone())
            .collect())
    }

    async fn dequeue(&self, ids: &[EnvelopeId]) -> Result<()> {
        let mut inner = self.lock();
        inner.queue.retain(|(id, _)| !ids.contains(id));
        Ok(())
    }

    async fn blacklist_add(&self, entry: BlacklistEntry) -> Result<()> {
        self.lock().blacklist.insert(entry);
        Ok(())
    }

    async fn is_blacklisted(&self, worker: WorkerId, job: JobId, task_type: &str) -> Result<bool> {
        Ok(self.lock().blacklist.contains(&BlacklistEntry {
            worker_id: worker,
            job_id: job,
            task_type: task_type.to_string(),
        }))
    }

    async fn blacklisted_job_task_types_for(&self, worker: WorkerId) -> Result<Vec<(JobId, String)>> {
        Ok(self
            .lock()
            .blacklist
            .iter()
            .filter(|entry| entry.worker_id == worker)
            .map(|entry| (entry.job_id, entry.task_type.clone()))
            .collect())
    }

    /// Recomputed live from current task documents on every call, matching
    /// the Go original's `maybeBlacklistWorker` (`coll.Find(queryFields).Count()`
    /// over `status IN {failed, soft-failed}` for this worker/job/task_type)
    /// rather than an accumulator: a task that later leaves `failed`/
    /// `soft-failed` (reassigned and completed, reset, ...) must stop
    /// counting toward the threshold.
    async fn record_failure(&self, worker: WorkerId, job: JobId, task_type: &str) -> Result<u32> {
        let inner = self.lock();
        let count = inner
            .tasks
            .values()
            .filter(|t| {
                t.worker_id == Some(worker)
                    && t.job == job
                    && t.task_type == task_type
                    && matches!(t.status, TaskStatus::Failed | TaskStatus::SoftFailed)
            })
            .count();
        Ok(count as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;

    #[tokio::test]
    async fn claim_prefers_highest_priority() {
        let store = MemoryStore::new();
        let job = JobId::new();
        let mut low = Task::new(job, "render", 10);
        let mut high = Task::new(job, "render", 50);
        low.status = TaskStatus::Queued;
        high.status = TaskStatus::Queued;
        store.put_task(low).await.unwrap();
        store.put_task(high.clone()).await.unwrap();

        let claimed = store
            .claim_runnable_task(&["render".to_string()], &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn claim_skips_excluded_job_task_type() {
        let store = MemoryStore::new();
        let job = JobId::new();
        let mut task = Task::new(job, "render", 10);
        task.status = TaskStatus::Queued;
        store.put_task(task).await.unwrap();

        let claimed = store
            .claim_runnable_task(&["render".to_string()], &[(job, "render".to_string())])
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn patch_task_returns_none_for_unknown_id() {
        let store = MemoryStore::new();
        let patch = TaskPatch::new().set("activity", "hi");
        let result = store.patch_task(TaskId::new(), patch).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn failure_count_reflects_live_failed_and_soft_failed_tasks() {
        let store = MemoryStore::new();
        let worker = WorkerId::new();
        let other_job = JobId::new();
        let job = JobId::new();

        let mut t1 = Task::new(job, "render", 1);
        t1.worker_id = Some(worker);
        t1.status = TaskStatus::Failed;
        let t1_id = t1.id;
        store.put_task(t1).await.unwrap();

        let mut t2 = Task::new(job, "render", 1);
        t2.worker_id = Some(worker);
        t2.status = TaskStatus::SoftFailed;
        store.put_task(t2).await.unwrap();

        // Different task type and different job must not count.
        let mut t3 = Task::new(job, "simulate", 1);
        t3.worker_id = Some(worker);
        t3.status = TaskStatus::Failed;
        store.put_task(t3).await.unwrap();
        let mut t4 = Task::new(other_job, "render", 1);
        t4.worker_id = Some(worker);
        t4.status = TaskStatus::Failed;
        store.put_task(t4).await.unwrap();

        assert_eq!(store.record_failure(worker, job, "render").await.unwrap(), 2);

        // A task leaving failed/soft-failed (e.g. reassigned and completed)
        // must stop counting toward the threshold.
        store
            .patch_task(t1_id, TaskPatch::new().set("status", TaskStatus::Completed))
            .await
            .unwrap();
        assert_eq!(store.record_failure(worker, job, "render").await.unwrap(), 1);
    }
}
