//! Task Update Queue (base spec §2, 22% of the core; §4.2 `QueueTaskUpdate`,
//! §4.5 cancellation reconciliation, §4.7 sign-off/task return).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::blacklist::Blacklist;
use crate::config::ManagerConfig;
use crate::ids::{JobId, TaskId, WorkerId};
use crate::log_store::LogStore;
use crate::model::task::TaskStatus;
use crate::model::update::{tail_lines, TaskUpdate};
use crate::store::{Store, TaskPatch};

pub struct TaskUpdateQueue {
    store: Arc<dyn Store>,
    blacklist: Arc<Blacklist>,
    log_store: Arc<LogStore>,
    config: ManagerConfig,
    sequence: AtomicU64,
}

impl TaskUpdateQueue {
    pub fn new(
        store: Arc<dyn Store>,
        blacklist: Arc<Blacklist>,
        log_store: Arc<LogStore>,
        config: ManagerConfig,
    ) -> Self {
        TaskUpdateQueue {
            store,
            blacklist,
            log_store,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// `QueueTaskUpdate(task, update, extra)` (base spec §4.2). `extra`
    /// carries caller-supplied `$set`/`$push` operations (e.g. the HTTP
    /// handler pushing `failed_by_workers` or setting progress fields)
    /// merged into the computed patch.
    pub async fn queue_task_update(&self, mut update: TaskUpdate, extra: TaskPatch) -> Result<()> {
        // Step 1+2: stamp arrival order, envelope id already assigned at
        // construction time.
        update.received_on_manager = self.next_sequence();

        // Step 3: tail-truncate for upstream, keep the full chunk for disk.
        let full_log = update.log.take();
        if let Some(log) = &full_log {
            update.log_tail = Some(tail_lines(log));
        }

        // Step 4: persist the envelope unless this is a synthetic update.
        if !update.manager_local {
            self.store.enqueue(update.clone()).await?;
        }

        let existing = self.store.get_task(update.task_id).await?;
        let current_status = existing.as_ref().map(|t| t.status);

        // Step 5: compute the local-task patch.
        let mut patch = TaskPatch::new();
        let is_worker_failure = !update.manager_local
            && update.worker_id.is_some()
            && update.new_status == Some(TaskStatus::Failed);

        if !is_worker_failure {
            if let Some(proposed) = update.new_status {
                if current_status.is_none_or(|cur| cur.can_transition_to(proposed)) {
                    patch = patch.set("status", proposed);
                } else {
                    tracing::debug!(
                        task_id = %update.task_id,
                        ?proposed,
                        "dropping invalid status transition"
                    );
                }
            }
        }
        if let Some(activity) = &update.activity {
            if !activity.is_empty() {
                patch = patch.set("activity", activity.clone());
            }
        }
        if let Some(log) = &full_log {
            if !log.is_empty() {
                patch = patch.set("log", log.clone());
            }
        }
        patch.set.extend(extra.set);
        patch.push.extend(extra.push);

        // Step 6: append the log fragment to disk.
        if let Some(log) = &full_log {
            if let Err(err) = self.log_store.append(update.job_id, update.task_id, log).await {
                tracing::warn!(error = %err, task_id = %update.task_id, "failed to write task log fragment");
            }
        }

        // Step 7: apply the patch.
        let patched = if !patch.is_empty() {
            self.store.patch_task(update.task_id, patch).await?
        } else {
            existing
        };
        if patched.is_none() {
            tracing::warn!(task_id = %update.task_id, "task update for unknown task, cache mutation dropped");
        }

        // Worker-initiated failures run the escalation table before status
        // changes are considered final.
        if is_worker_failure {
            if let Some(worker) = update.worker_id {
                self.handle_worker_failure(update.task_id, worker).await?;
            }
        }

        // Step 8: rotate on entering `active`, log on any status change.
        let final_status = self
            .store
            .get_task(update.task_id)
            .await?
            .map(|t| t.status);
        if let Some(final_status) = final_status {
            if current_status != Some(final_status) {
                tracing::info!(task_id = %update.task_id, ?final_status, "task status changed");
                if final_status == TaskStatus::Active {
                    if let Err(err) = self.log_store.rotate(update.job_id, update.task_id).await {
                        tracing::warn!(error = %err, task_id = %update.task_id, "log rotation failed");
                    }
                }
            }
        }

        Ok(())
    }

    /// Base spec §4.2 "Worker-failure handling". Runs after the main patch
    /// (including the caller's `failed_by_workers` push) has already been
    /// applied, so `task.failed_by_workers` here includes the worker that
    /// just failed.
    async fn handle_worker_failure(&self, task_id: TaskId, worker: WorkerId) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };

        let workers_left = self
            .blacklist
            .workers_left(task.job, &task.task_type, &task.failed_by_workers)
            .await?;
        let hard_fail = task.failed_by_workers.len() as u32 >= self.config.task_fail_after_soft_fail_count
            || workers_left.is_empty();
        let target = if hard_fail {
            TaskStatus::Failed
        } else {
            TaskStatus::SoftFailed
        };

        if task.status.can_transition_to(target) {
            self.store
                .patch_task(task_id, TaskPatch::new().set("status", target))
                .await?;
        } else {
            tracing::debug!(
                task_id = %task_id,
                ?target,
                current = ?task.status,
                "escalation target is not a valid transition, leaving status untouched"
            );
        }

        let failure_count = self
            .store
            .record_failure(worker, task.job, &task.task_type)
            .await?;
        if failure_count < self.config.blacklist_threshold {
            return Ok(());
        }

        self.blacklist.add(worker, task.job, &task.task_type).await?;
        let remaining = self
            .blacklist
            .workers_left(task.job, &task.task_type, &[])
            .await?;
        if !remaining.is_empty() {
            return Ok(());
        }

        let worker_ident = self
            .store
            .get_worker(worker)
            .await?
            .map(|w| w.identifier())
            .unwrap_or_else(|| worker.to_string());

        let affected = self
            .store
            .tasks_not_hard_failed(worker, task.job, &task.task_type)
            .await?;
        for affected_task in affected {
            let synthetic = TaskUpdate::manager_local(affected_task.id, affected_task.job, TaskStatus::Failed)
                .with_activity(format!(
                    "Manager hard-failed task after blacklisting worker {worker_ident}"
                ));
            self.queue_task_update(synthetic, TaskPatch::new()).await?;
        }

        Ok(())
    }

    /// Base spec §4.5 "Cancellation reconciliation".
    pub async fn reconcile_cancellations(&self, task_ids: &[TaskId]) -> Result<()> {
        for &task_id in task_ids {
            let existing = self.store.get_task(task_id).await?;
            match existing {
                Some(task) if task.status == TaskStatus::Active => {
                    self.store
                        .patch_task(task_id, TaskPatch::new().set("status", TaskStatus::CancelRequested))
                        .await?;
                }
                Some(task) => {
                    let synthetic = TaskUpdate::manager_local(task_id, task.job, TaskStatus::Canceled)
                        .with_activity("Manager cancelled task by request of Flamenco Server")
                        .with_log_line(format!(
                            "{} Manager cancelled task by request of Flamenco Server",
                            proxmox_time::epoch_to_rfc3339_utc(proxmox_time::epoch_i64())
                                .unwrap_or_default()
                        ));
                    self.queue_task_update(synthetic, TaskPatch::new()).await?;
                }
                None => {
                    // Unknown locally: still enqueue, using the "unknown job"
                    // sentinel, which suppresses the disk log write.
                    let synthetic =
                        TaskUpdate::manager_local(task_id, JobId::UNKNOWN, TaskStatus::Canceled)
                            .with_activity("Manager cancelled task by request of Flamenco Server");
                    self.queue_task_update(synthetic, TaskPatch::new()).await?;
                }
            }
        }
        Ok(())
    }

    /// Base spec §4.7 "Return-all-tasks". Shared by sign-off and the worker
    /// remover; `reason` distinguishes the two (SPEC_FULL.md §B.6).
    pub async fn return_all_tasks(&self, worker: WorkerId, reason: &str) -> Result<()> {
        let tasks = self.store.tasks_assigned_to(worker).await?;
        for task in tasks {
            let synthetic =
                TaskUpdate::manager_local(task.id, task.job, TaskStatus::ClaimedByManager)
                    .with_activity(reason)
                    .with_log_line(reason);
            self.queue_task_update(synthetic, TaskPatch::new()).await?;
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
