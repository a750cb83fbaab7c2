//! Task Scheduler (base spec §2, 20% of the core; §4.1 "assign a task").

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::ids::WorkerId;
use crate::model::task::Task;
use crate::store::Store;
use crate::upstream::UpstreamClient;
use crate::varrepl;
use crate::workers::WorkerRegistry;

/// Refetch-loop attempt budget before giving up and reporting a livelock
/// (base spec §4.1 step 3, step 4).
const MAX_REFETCH_ATTEMPTS: u32 = 1000;

/// How long to let the upstream downloader populate the queue before
/// retrying once, after kicking it (base spec §4.1 step 3b).
const POST_KICK_GRACE: Duration = Duration::from_millis(50);

pub struct Scheduler {
    store: Arc<dyn Store>,
    workers: Arc<WorkerRegistry>,
    upstream: Arc<dyn UpstreamClient>,
    config: ManagerConfig,
    /// "Process-wide mutable scheduler state" in the original is module
    /// global; here it is a field on the component instance, starting at
    /// zero (base spec §9).
    last_upstream_kick: AtomicI64,
}

pub enum Assignment {
    Task(Task),
    NoTasks,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        workers: Arc<WorkerRegistry>,
        upstream: Arc<dyn UpstreamClient>,
        config: ManagerConfig,
    ) -> Self {
        Scheduler {
            store,
            workers,
            upstream,
            config,
            last_upstream_kick: AtomicI64::new(0),
        }
    }

    pub async fn assign_task(
        &self,
        worker_id: WorkerId,
        peer_host: &str,
        user_agent: &str,
    ) -> Result<Assignment, ManagerError> {
        let worker = self
            .workers
            .mark_seen(worker_id, peer_host, user_agent)
            .await?
            .ok_or(ManagerError::UnknownWorker)?;

        if worker.supported_task_types.is_empty() {
            return Ok(Assignment::NoTasks);
        }

        let excluded = self
            .store
            .blacklisted_job_task_types_for(worker_id)
            .await?;

        let mut claimed: Option<Task> = None;
        for attempt in 0..MAX_REFETCH_ATTEMPTS {
            let found = self
                .store
                .claim_runnable_task(&worker.supported_task_types, &excluded)
                .await?;

            let Some(task) = found else {
                if attempt == 0 && self.should_kick_upstream() {
                    self.upstream.kick_task_downloader().await;
                    tokio::time::sleep(POST_KICK_GRACE).await;
                    continue;
                }
                return Ok(Assignment::NoTasks);
            };

            match self.upstream.refetch_task(task.id).await? {
                Some(newer) => {
                    self.store.put_task(newer).await?;
                    continue;
                }
                None => {
                    claimed = Some(task);
                    break;
                }
            }
        }

        let Some(mut task) = claimed else {
            tracing::error!(worker_id = %worker_id, "scheduler livelock: exhausted refetch attempts");
            return Err(ManagerError::SchedulerLivelock);
        };

        varrepl::expand_commands(
            &mut task.commands,
            &self.config.variables,
            &self.config.path_replacement,
            &worker.platform,
        );

        self.workers
            .ping_task(worker_id, task.id, Some(task.status))
            .await?;
        self.store
            .patch_task(
                task.id,
                crate::store::TaskPatch::new().set("worker_id", worker_id),
            )
            .await?;

        Ok(Assignment::Task(task))
    }

    /// Whether the recheck-throttle window has elapsed since the last kick.
    /// A negative `download_task_recheck_throttle` means "never kick on
    /// demand" (base spec §4.1 step 3b).
    fn should_kick_upstream(&self) -> bool {
        let throttle = self.config.download_task_recheck_throttle;
        if throttle < 0 {
            return false;
        }
        let now = proxmox_time::epoch_i64();
        let last = self.last_upstream_kick.load(Ordering::SeqCst);
        if now - last < throttle {
            return false;
        }
        self.last_upstream_kick.store(now, Ordering::SeqCst);
        true
    }
}
