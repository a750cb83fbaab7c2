//! Integration test wiring `Scheduler` + `TaskUpdateQueue` +
//! `TaskUpdatePusher` + `MemoryStore` together through [`Manager`] itself,
//! rather than through any one component's private test harness (base spec
//! §8 scenarios 1 and 4).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use flamenco_manager::clock::{Clock, FakeClock};
use flamenco_manager::config::ManagerConfig;
use flamenco_manager::ids::{JobId, TaskId};
use flamenco_manager::model::task::{Task, TaskStatus};
use flamenco_manager::model::update::TaskUpdate;
use flamenco_manager::scheduler::Assignment;
use flamenco_manager::store::memory::MemoryStore;
use flamenco_manager::store::{Store, TaskPatch};
use flamenco_manager::upstream::{
    FileUploader, NullFileUploader, PushResponse, UpstreamClient,
};
use flamenco_manager::Manager;

/// Stands in for the out-of-scope upstream HTTP client (base spec §1).
/// Same shape as `pusher.rs`'s private `RecordingUpstream`, but `Mutex`
/// over `tokio::sync` rather than `std::sync`, since it is driven from a
/// real background task here instead of called inline from a test body.
struct SharedUpstream {
    responses: Mutex<Vec<PushResponse>>,
    pushed_batches: Mutex<Vec<usize>>,
}

impl SharedUpstream {
    fn new() -> Self {
        SharedUpstream {
            responses: Mutex::new(Vec::new()),
            pushed_batches: Mutex::new(Vec::new()),
        }
    }

    async fn queue_response(&self, response: PushResponse) {
        self.responses.lock().await.push(response);
    }
}

#[async_trait]
impl UpstreamClient for SharedUpstream {
    async fn kick_task_downloader(&self) {}

    async fn refetch_task(&self, _task_id: TaskId) -> anyhow::Result<Option<Task>> {
        Ok(None)
    }

    async fn push_updates(&self, batch: &[TaskUpdate]) -> anyhow::Result<PushResponse> {
        self.pushed_batches.lock().await.push(batch.len());
        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            Ok(PushResponse::default())
        } else {
            Ok(responses.remove(0))
        }
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not met within the timeout");
}

#[tokio::test]
async fn claim_update_push_and_cancel_cycle_through_manager() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FakeClock::new(1_000));
    let upstream = Arc::new(SharedUpstream::new());

    // Push intervals pushed far out so only the explicit kicks below drive
    // the pusher; the pusher's own timing math is covered in pusher.rs.
    let mut config = ManagerConfig::default();
    config.task_update_push_max_interval = Duration::from_secs(3600);
    config.cancel_task_fetch_interval = Duration::from_secs(3600);

    let mut manager = Manager::new(
        config,
        store.clone() as Arc<dyn Store>,
        clock.clone() as Arc<dyn Clock>,
        upstream.clone() as Arc<dyn UpstreamClient>,
    );
    manager.go(
        store.clone() as Arc<dyn Store>,
        upstream.clone() as Arc<dyn UpstreamClient>,
        Arc::new(NullFileUploader) as Arc<dyn FileUploader>,
    );

    let worker = manager
        .workers
        .register("10.0.0.5:1234", "hunter2")
        .await
        .unwrap();
    manager
        .workers
        .sign_on(worker.id, vec!["render".to_string()], None)
        .await
        .unwrap();

    let mut task = Task::new(JobId::new(), "render", 50);
    task.status = TaskStatus::Queued;
    let task_id = task.id;
    store.put_task(task).await.unwrap();

    let claimed = match manager
        .scheduler
        .assign_task(worker.id, "10.0.0.5", "test-worker/1.0")
        .await
        .unwrap()
    {
        Assignment::Task(task) => task,
        Assignment::NoTasks => panic!("expected the queued render task to be claimed"),
    };
    assert_eq!(claimed.id, task_id);
    assert_eq!(claimed.status, TaskStatus::Active);

    // Worker reports progress; the queue stamps an envelope for the pusher.
    let mut update = TaskUpdate::from_worker(task_id, claimed.job, worker.id);
    update.new_status = Some(TaskStatus::Active);
    update.activity = Some("rendering frame 1".to_string());
    manager
        .task_updates
        .queue_task_update(update, TaskPatch::new())
        .await
        .unwrap();

    let after_update = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(after_update.status, TaskStatus::Active);
    assert_eq!(after_update.activity, "rendering frame 1");
    assert_eq!(store.queue_len().await.unwrap(), 1);

    // Force the real pusher loop to drain the queue instead of waiting on
    // its ticker (base spec §4.4 step 2 "forced by a kick").
    let kick = manager.pusher_kick_handle().expect("pusher should be running");
    kick.notify_one();
    wait_until(|| async { store.queue_len().await.unwrap() == 0 }).await;
    assert_eq!(*upstream.pushed_batches.lock().await, vec![1]);

    // Upstream answers a later push by asking for this (still active) task
    // to be cancelled (base spec §4.5 reconciliation, §8 scenario 1 shape).
    upstream
        .queue_response(PushResponse {
            handled_ids: vec![],
            cancel_task_ids: vec![task_id],
            upload_file_requests: vec![],
        })
        .await;
    kick.notify_one();
    wait_until(|| async {
        store
            .get_task(task_id)
            .await
            .unwrap()
            .map(|t| t.status)
            == Some(TaskStatus::CancelRequested)
    })
    .await;

    manager.close().await;
}
