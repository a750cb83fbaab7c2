//! Worker Remover (base spec §2, 6% of the core; §4.6).
//!
//! Optional: only runs at all when [`ManagerConfig::worker_cleanup_enabled`]
//! is true. `lib.rs` only constructs one of these when that holds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::clock::{Clock, Ticker};
use crate::closable::{CloseSignal, Closable};
use crate::config::ManagerConfig;
use crate::store::Store;
use crate::task_updates::TaskUpdateQueue;

/// Delay before the first cleanup sweep (base spec §4.6).
const INITIAL_GRACE: Duration = Duration::from_secs(5 * 60);
/// Sweep cadence thereafter.
const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Reason string on the synthetic requeue this component enqueues,
/// distinct from the sign-off reason (SPEC_FULL.md §B.6).
const CLEANUP_REASON: &str = "worker is being auto-removed";

pub struct WorkerRemover {
    closable: Closable,
}

impl WorkerRemover {
    pub fn spawn(
        store: Arc<dyn Store>,
        task_updates: Arc<TaskUpdateQueue>,
        clock: Arc<dyn Clock>,
        config: ManagerConfig,
    ) -> Self {
        let closable = Closable::spawn(move |mut close| async move {
            tracing::info!("worker remover starting");

            tokio::select! {
                _ = tokio::time::sleep(INITIAL_GRACE) => {}
                _ = close.wait_for_close() => {
                    tracing::info!("worker remover stopped before first sweep");
                    return;
                }
            }

            let mut ticker = Ticker::new(SWEEP_PERIOD);
            loop {
                if let Err(err) = sweep(&store, &task_updates, &*clock, &config).await {
                    tracing::warn!(error = %err, "worker cleanup sweep failed");
                }
                if !ticker.tick_or_close(&mut close).await {
                    break;
                }
            }
            tracing::info!("worker remover stopped");
        });

        WorkerRemover { closable }
    }

    pub async fn close(&mut self) {
        self.closable.close().await;
    }
}

/// One cleanup pass (base spec §4.6 steps 1-2).
async fn sweep(
    store: &Arc<dyn Store>,
    task_updates: &Arc<TaskUpdateQueue>,
    clock: &dyn Clock,
    config: &ManagerConfig,
) -> Result<()> {
    let threshold = clock.now() - config.worker_cleanup_max_age.as_secs() as i64;
    let stale = store
        .workers_for_cleanup(&config.worker_cleanup_status, threshold)
        .await?;

    for worker in stale {
        tracing::info!(worker_id = %worker.id, "auto-removing idle worker");
        task_updates.return_all_tasks(worker.id, CLEANUP_REASON).await?;
        store.delete_worker(worker.id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::Blacklist;
    use crate::clock::FakeClock;
    use crate::ids::JobId;
    use crate::model::task::{Task, TaskStatus};
    use crate::model::worker::{Worker, WorkerStatus};
    use crate::store::memory::MemoryStore;

    fn setup() -> (Arc<dyn Store>, Arc<TaskUpdateQueue>, Arc<FakeClock>, ManagerConfig) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let blacklist = Arc::new(Blacklist::new(store.clone()));
        let log_store = Arc::new(crate::log_store::LogStore::new(
            std::env::temp_dir().join("flamenco-manager-test-remover"),
        ));
        let mut config = ManagerConfig::default();
        config.worker_cleanup_max_age = Duration::from_secs(3600);
        config.worker_cleanup_status = vec![WorkerStatus::Timeout, WorkerStatus::Asleep];
        let clock = Arc::new(FakeClock::new(10_000));
        let task_updates = Arc::new(TaskUpdateQueue::new(store.clone(), blacklist, log_store, config.clone()));
        (store, task_updates, clock, config)
    }

    #[tokio::test]
    async fn sweep_removes_idle_worker_and_requeues_its_tasks() {
        let (store, task_updates, clock, config) = setup();

        let mut worker = Worker::new("10.0.0.4", "hash");
        worker.status = WorkerStatus::Timeout;
        worker.last_activity = 1_000; // far older than the 3600s cleanup age
        let worker_id = worker.id;
        store.put_worker(worker).await.unwrap();

        let job = JobId::new();
        let mut task = Task::new(job, "render", 1);
        task.status = TaskStatus::Active;
        task.worker_id = Some(worker_id);
        let task_id = task.id;
        store.put_task(task).await.unwrap();

        sweep(&store, &task_updates, &*clock, &config).await.unwrap();

        assert!(store.get_worker(worker_id).await.unwrap().is_none());
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::ClaimedByManager);
    }

    #[tokio::test]
    async fn sweep_leaves_recently_active_workers_alone() {
        let (store, task_updates, clock, config) = setup();

        let mut worker = Worker::new("10.0.0.4", "hash");
        worker.status = WorkerStatus::Timeout;
        worker.last_activity = clock.now() - 10; // well within the cleanup window
        let worker_id = worker.id;
        store.put_worker(worker).await.unwrap();

        sweep(&store, &task_updates, &*clock, &config).await.unwrap();

        assert!(store.get_worker(worker_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_ignores_statuses_not_configured_for_cleanup() {
        let (store, task_updates, clock, config) = setup();

        let mut worker = Worker::new("10.0.0.4", "hash");
        worker.status = WorkerStatus::Awake;
        worker.last_activity = 1_000;
        let worker_id = worker.id;
        store.put_worker(worker).await.unwrap();

        sweep(&store, &task_updates, &*clock, &config).await.unwrap();

        assert!(store.get_worker(worker_id).await.unwrap().is_some());
    }
}
