//! Task Update Pusher (base spec §2, 14% of the core; §4.4).
//!
//! A single background loop draining the queue to upstream in bounded
//! batches. Exactly one pusher exists per process (base spec §4.4
//! "Concurrency contract") — enforced by construction, since [`Manager`]
//! (in `lib.rs`) only ever creates one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;

use crate::clock::{Clock, Ticker};
use crate::closable::{CloseSignal, Closable};
use crate::config::ManagerConfig;
use crate::store::Store;
use crate::task_updates::TaskUpdateQueue;
use crate::upstream::{FileUploader, UpstreamClient};

const TICK_PERIOD: Duration = Duration::from_secs(1);

pub struct TaskUpdatePusher {
    closable: Closable,
    kick: Arc<Notify>,
}

impl TaskUpdatePusher {
    /// Starts the loop (base spec §2 "`Go()` to start background work").
    pub fn spawn(
        store: Arc<dyn Store>,
        queue: Arc<TaskUpdateQueue>,
        upstream: Arc<dyn UpstreamClient>,
        uploader: Arc<dyn FileUploader>,
        config: ManagerConfig,
    ) -> Self {
        Self::spawn_with_clock(store, queue, upstream, uploader, config, Arc::new(crate::clock::SystemClock))
    }

    pub fn spawn_with_clock(
        store: Arc<dyn Store>,
        queue: Arc<TaskUpdateQueue>,
        upstream: Arc<dyn UpstreamClient>,
        uploader: Arc<dyn FileUploader>,
        config: ManagerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let kick = Arc::new(Notify::new());
        let kick_for_loop = kick.clone();

        let closable = Closable::spawn(move |mut close| async move {
            let state = PusherLoop {
                store,
                queue,
                upstream,
                uploader,
                config,
                clock,
                last_push: AtomicI64::new(0),
            };
            let mut ticker = Ticker::new(TICK_PERIOD);
            tracing::info!("task update pusher starting");
            loop {
                tokio::select! {
                    tick_ok = ticker.tick_or_close(&mut close) => {
                        if !tick_ok {
                            break;
                        }
                        if let Err(err) = state.maybe_push(false).await {
                            tracing::warn!(error = %err, "task update push cycle failed");
                        }
                    }
                    _ = kick_for_loop.notified() => {
                        if let Err(err) = state.maybe_push(true).await {
                            tracing::warn!(error = %err, "forced task update push failed");
                        }
                    }
                }
                if close.is_closing() {
                    break;
                }
            }
            tracing::info!("task update pusher stopped");
        });

        TaskUpdatePusher { closable, kick }
    }

    /// External "kick" (base spec §4.4 step 2, first bullet): force a push
    /// on the next loop iteration regardless of batch size or timing.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// A shareable handle callers (e.g. the HTTP layer) can hold onto and
    /// notify without needing a reference to the pusher itself.
    pub fn kick_handle(&self) -> Arc<Notify> {
        self.kick.clone()
    }

    pub async fn close(&mut self) {
        self.closable.close().await;
    }
}

struct PusherLoop {
    store: Arc<dyn Store>,
    queue: Arc<TaskUpdateQueue>,
    upstream: Arc<dyn UpstreamClient>,
    uploader: Arc<dyn FileUploader>,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    last_push: AtomicI64,
}

impl PusherLoop {
    async fn maybe_push(&self, forced: bool) -> Result<()> {
        let queued = self.store.queue_len().await?;
        let now = self.clock.now();
        let last = self.last_push.load(Ordering::SeqCst);
        let since_last_push = now - last;

        let regular_push = since_last_push >= self.config.task_update_push_max_interval.as_secs() as i64
            && queued > 0;
        let cancel_poll_push = since_last_push >= self.config.cancel_task_fetch_interval.as_secs() as i64;
        let over_batch_limit = queued >= self.config.task_update_push_max_count;

        let should_push = forced || over_batch_limit || regular_push || cancel_poll_push;
        if !should_push {
            return Ok(());
        }

        let batch = self
            .store
            .queue_batch(self.config.task_update_push_max_count)
            .await?;
        tracing::debug!(batch_len = batch.len(), forced, "pushing task updates upstream");

        let response = match self.upstream.push_updates(&batch).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "upstream push failed, updates remain queued");
                return Ok(());
            }
        };

        let handled_count = response.handled_ids.len();
        if !response.handled_ids.is_empty() {
            if let Err(err) = self.store.dequeue(&response.handled_ids).await {
                tracing::error!(error = %err, "failed to delete pushed envelopes from queue, duplicates will occur");
                return Err(err);
            }
        }

        if !response.cancel_task_ids.is_empty() {
            self.queue.reconcile_cancellations(&response.cancel_task_ids).await?;
        }

        for request in response.upload_file_requests {
            let uploader = self.uploader.clone();
            tokio::spawn(async move {
                uploader.upload(request).await;
            });
        }

        let full_success = handled_count == batch.len();
        if full_success {
            self.last_push.store(now, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::ids::{EnvelopeId, JobId, TaskId};
    use crate::model::task::TaskStatus;
    use crate::model::update::TaskUpdate;
    use crate::store::memory::MemoryStore;
    use crate::upstream::{NullFileUploader, PushResponse, UploadFileRequest};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingUpstream {
        responses: StdMutex<Vec<PushResponse>>,
        pushes: StdMutex<Vec<usize>>,
    }

    #[async_trait]
    impl UpstreamClient for RecordingUpstream {
        async fn kick_task_downloader(&self) {}

        async fn refetch_task(&self, _task_id: TaskId) -> Result<Option<crate::model::task::Task>> {
            Ok(None)
        }

        async fn push_updates(&self, batch: &[TaskUpdate]) -> Result<PushResponse> {
            self.pushes.lock().unwrap().push(batch.len());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(PushResponse::default())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<TaskUpdateQueue>, Arc<FakeClock>) {
        let store = Arc::new(MemoryStore::new());
        let blacklist = Arc::new(crate::blacklist::Blacklist::new(store.clone() as Arc<dyn Store>));
        let log_store = Arc::new(crate::log_store::LogStore::new(
            std::env::temp_dir().join("flamenco-manager-test-pusher"),
        ));
        let config = ManagerConfig::default();
        let queue = Arc::new(TaskUpdateQueue::new(
            store.clone() as Arc<dyn Store>,
            blacklist,
            log_store,
            config,
        ));
        let clock = Arc::new(FakeClock::new(1_000));
        (store, queue, clock)
    }

    #[tokio::test]
    async fn empty_queue_cancel_poll_enqueues_synthetic_cancellation() {
        // base spec §8 scenario 1.
        let (store, queue, clock) = setup();
        let mut config = ManagerConfig::default();
        config.cancel_task_fetch_interval = Duration::from_secs(10);
        config.task_update_push_max_interval = Duration::from_secs(30);

        let unknown_task = TaskId::new();
        let upstream = Arc::new(RecordingUpstream {
            responses: StdMutex::new(vec![PushResponse {
                handled_ids: vec![],
                cancel_task_ids: vec![unknown_task],
                upload_file_requests: vec![],
            }]),
            pushes: StdMutex::new(Vec::new()),
        });

        clock.advance(Duration::from_secs(11));
        let state = PusherLoop {
            store: store.clone() as Arc<dyn Store>,
            queue: queue.clone(),
            upstream: upstream.clone() as Arc<dyn UpstreamClient>,
            uploader: Arc::new(NullFileUploader),
            config,
            clock: clock.clone() as Arc<dyn Clock>,
            last_push: AtomicI64::new(1_000),
        };
        state.maybe_push(false).await.unwrap();

        assert_eq!(*upstream.pushes.lock().unwrap(), vec![0]);
        assert_eq!(store.queue_len().await.unwrap(), 1);
        let batch = store.queue_batch(10).await.unwrap();
        assert!(batch[0].job_id.is_unknown());
    }

    #[tokio::test]
    async fn forced_kick_pushes_regardless_of_timing() {
        let (store, queue, clock) = setup();
        let mut config = ManagerConfig::default();
        config.task_update_push_max_interval = Duration::from_secs(3600);
        config.cancel_task_fetch_interval = Duration::from_secs(3600);

        let job = JobId::new();
        let task_id = TaskId::new();
        let mut update = TaskUpdate::from_worker(task_id, job, crate::ids::WorkerId::new());
        update.id = EnvelopeId::new();
        store.enqueue(update).await.unwrap();

        let upstream = Arc::new(RecordingUpstream {
            responses: StdMutex::new(Vec::new()),
            pushes: StdMutex::new(Vec::new()),
        });
        let state = PusherLoop {
            store: store.clone() as Arc<dyn Store>,
            queue,
            upstream: upstream.clone() as Arc<dyn UpstreamClient>,
            uploader: Arc::new(NullFileUploader),
            config,
            clock: clock.clone() as Arc<dyn Clock>,
            last_push: AtomicI64::new(clock.now()),
        };

        state.maybe_push(false).await.unwrap();
        assert!(upstream.pushes.lock().unwrap().is_empty());

        state.maybe_push(true).await.unwrap();
        assert_eq!(*upstream.pushes.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn partial_ack_only_dequeues_handled_envelopes() {
        let (store, queue, clock) = setup();
        let job = JobId::new();
        let worker = crate::ids::WorkerId::new();
        let update_a = TaskUpdate::from_worker(TaskId::new(), job, worker);
        let update_b = TaskUpdate::from_worker(TaskId::new(), job, worker);
        let handled_id = update_a.id;
        store.enqueue(update_a).await.unwrap();
        store.enqueue(update_b).await.unwrap();

        let mut config = ManagerConfig::default();
        config.task_update_push_max_count = 10;

        let upstream = Arc::new(RecordingUpstream {
            responses: StdMutex::new(vec![PushResponse {
                handled_ids: vec![handled_id],
                cancel_task_ids: vec![],
                upload_file_requests: vec![],
            }]),
            pushes: StdMutex::new(Vec::new()),
        });
        let state = PusherLoop {
            store: store.clone() as Arc<dyn Store>,
            queue,
            upstream,
            uploader: Arc::new(NullFileUploader),
            config,
            clock: clock.clone() as Arc<dyn Clock>,
            last_push: AtomicI64::new(clock.now()),
        };

        state.maybe_push(true).await.unwrap();
        assert_eq!(store.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upload_requests_are_handed_off() {
        let (store, queue, clock) = setup();
        let upstream = Arc::new(RecordingUpstream {
            responses: StdMutex::new(vec![PushResponse {
                handled_ids: vec![],
                cancel_task_ids: vec![],
                upload_file_requests: vec![UploadFileRequest {
                    task_id: TaskId::new(),
                    file_path: "render_0001.png".to_string(),
                }],
            }]),
            pushes: StdMutex::new(Vec::new()),
        });
        let state = PusherLoop {
            store: store.clone() as Arc<dyn Store>,
            queue,
            upstream,
            uploader: Arc::new(NullFileUploader),
            config: ManagerConfig::default(),
            clock: clock.clone() as Arc<dyn Clock>,
            last_push: AtomicI64::new(clock.now()),
        };
        // doesn't panic, upload is fire-and-forget
        state.maybe_push(true).await.unwrap();
    }
}
