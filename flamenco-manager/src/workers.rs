//! Worker Registry (base spec §2, 10% of the core; §4.3 seen/ping, §4.7
//! sign-on/sign-off, SPEC_FULL.md §B supplemented `may-i-run` semantics).

use std::sync::Arc;

use anyhow::Result;

use crate::clock::Clock;
use crate::ids::{TaskId, WorkerId};
use crate::model::task::TaskStatus;
use crate::model::worker::{Worker, WorkerStatus};
use crate::store::{Store, WorkerPatch};
use crate::task_updates::TaskUpdateQueue;

pub struct WorkerRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        WorkerRegistry { store, clock }
    }

    /// `register-worker`: stores the worker under a fresh id with a hashed
    /// secret and returns the full record (SPEC_FULL.md §B.3), never the
    /// plaintext secret (§B.4).
    pub async fn register(&self, address: impl Into<String>, secret: &str) -> Result<Worker> {
        let hash =
            proxmox_sys::crypt::encrypt_pw(secret).map_err(|err| anyhow::anyhow!("hashing worker secret: {err}"))?;
        let worker = Worker::new(address, hash);
        self.store.put_worker(worker.clone()).await?;
        tracing::info!(worker_id = %worker.id, "registered worker");
        Ok(worker)
    }

    pub async fn verify_secret(&self, id: WorkerId, secret: &str) -> Result<bool> {
        let Some(worker) = self.store.get_worker(id).await? else {
            return Ok(false);
        };
        Ok(proxmox_sys::crypt::verify_crypt_pw(secret, &worker.secret_hash).is_ok())
    }

    /// Refreshes the bookkeeping every authenticated request performs (base
    /// spec §4.3): `last_activity`, `status = awake`, `address`, `software`.
    pub async fn mark_seen(
        &self,
        id: WorkerId,
        peer_host: &str,
        user_agent: &str,
    ) -> Result<Option<Worker>> {
        let patch = WorkerPatch::new()
            .set("last_activity", self.clock.now())
            .set("status", WorkerStatus::Awake)
            .set("address", peer_host)
            .set("software", user_agent);
        self.store.patch_worker(id, patch).await
    }

    /// `WorkerPingedTask` (base spec §4.3): updates the task's `worker_id`
    /// and `last_worker_ping`, and the worker's `current_task_updated` (and
    /// `current_task_status` if given).
    pub async fn ping_task(
        &self,
        worker: WorkerId,
        task: TaskId,
        status: Option<TaskStatus>,
    ) -> Result<()> {
        let now = self.clock.now();
        let task_patch = crate::store::TaskPatch::new()
            .set("worker_id", worker)
            .set("last_worker_ping", now);
        self.store.patch_task(task, task_patch).await?;

        let mut worker_patch = WorkerPatch::new().set("current_task_updated", now);
        if let Some(status) = status {
            worker_patch = worker_patch.set("current_task_status", status);
        }
        self.store.patch_worker(worker, worker_patch).await?;
        Ok(())
    }

    /// `sign-on`: declare task-type support and an optional nickname.
    /// Clears `current_task` since it becomes stale the moment a fresh
    /// support set is declared (SPEC_FULL.md §B.5).
    pub async fn sign_on(
        &self,
        id: WorkerId,
        supported_task_types: Vec<String>,
        nickname: Option<String>,
    ) -> Result<Option<Worker>> {
        let mut patch = WorkerPatch::new()
            .set("supported_task_types", supported_task_types)
            .unset("current_task");
        if let Some(nickname) = nickname {
            patch = patch.set("nickname", nickname);
        }
        self.store.patch_worker(id, patch).await
    }

    /// `sign-off`: return active tasks to the queue and go `down` (base
    /// spec §4.7).
    pub async fn sign_off(&self, queue: &TaskUpdateQueue, id: WorkerId) -> Result<()> {
        queue
            .return_all_tasks(id, "Worker signed off, task reclaimed by Manager")
            .await?;
        self.store
            .patch_worker(id, WorkerPatch::new().set("status", WorkerStatus::Down))
            .await?;
        Ok(())
    }

    /// `/may-i-run/{id}` (SPEC_FULL.md §B.2): answers whether `worker` may
    /// keep running `task`, with the original's three not-allowed reasons.
    pub async fn may_i_run(&self, worker: WorkerId, task: TaskId) -> Result<(bool, String)> {
        let Some(t) = self.store.get_task(task).await? else {
            return Ok((false, "task not found".to_string()));
        };
        if t.worker_id != Some(worker) {
            return Ok((false, "task is assigned to a different worker".to_string()));
        }
        if !t.status.is_runnable() {
            return Ok((
                false,
                format!("task status {:?} is not runnable", t.status),
            ));
        }
        self.ping_task(worker, task, None).await?;
        Ok((true, String::new()))
    }

    pub async fn get(&self, id: WorkerId) -> Result<Option<Worker>> {
        self.store.get_worker(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::Blacklist;
    use crate::clock::SystemClock;
    use crate::config::ManagerConfig;
    use crate::ids::JobId;
    use crate::log_store::LogStore;
    use crate::model::task::Task;
    use crate::store::memory::MemoryStore;

    fn registry() -> (WorkerRegistry, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        (WorkerRegistry::new(store.clone(), Arc::new(SystemClock)), store)
    }

    #[tokio::test]
    async fn register_then_verify_roundtrips_secret() {
        let (registry, _store) = registry();
        let worker = registry.register("10.0.0.9", "s3cr3t").await.unwrap();
        assert!(registry.verify_secret(worker.id, "s3cr3t").await.unwrap());
        assert!(!registry.verify_secret(worker.id, "wrong").await.unwrap());
    }

    #[tokio::test]
    async fn sign_on_clears_current_task() {
        let (registry, store) = registry();
        let mut worker = Worker::new("10.0.0.9", "hash");
        worker.current_task = Some(TaskId::new());
        let id = worker.id;
        store.put_worker(worker).await.unwrap();

        registry
            .sign_on(id, vec!["render".to_string()], Some("box1".to_string()))
            .await
            .unwrap();

        let worker = store.get_worker(id).await.unwrap().unwrap();
        assert!(worker.current_task.is_none());
        assert_eq!(worker.nickname.as_deref(), Some("box1"));
    }

    #[tokio::test]
    async fn may_i_run_reports_wrong_worker() {
        let (registry, store) = registry();
        let job = JobId::new();
        let mut task = Task::new(job, "render", 1);
        task.status = TaskStatus::Active;
        task.worker_id = Some(WorkerId::new());
        let task_id = task.id;
        store.put_task(task).await.unwrap();

        let (may_run, reason) = registry.may_i_run(WorkerId::new(), task_id).await.unwrap();
        assert!(!may_run);
        assert_eq!(reason, "task is assigned to a different worker");
    }

    #[tokio::test]
    async fn sign_off_requeues_active_tasks_and_goes_down() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let blacklist = Arc::new(Blacklist::new(store.clone()));
        let log_store = Arc::new(LogStore::new(std::env::temp_dir().join("flamenco-manager-test-signoff")));
        let queue = TaskUpdateQueue::new(store.clone(), blacklist, log_store, ManagerConfig::default());
        let registry = WorkerRegistry::new(store.clone(), Arc::new(SystemClock));

        let worker = Worker::new("10.0.0.9", "hash");
        let worker_id = worker.id;
        store.put_worker(worker).await.unwrap();

        let job = JobId::new();
        let mut task = Task::new(job, "render", 1);
        task.status = TaskStatus::Active;
        task.worker_id = Some(worker_id);
        let task_id = task.id;
        store.put_task(task).await.unwrap();

        registry.sign_off(&queue, worker_id).await.unwrap();

        let worker = store.get_worker(worker_id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Down);
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::ClaimedByManager);
    }
}
