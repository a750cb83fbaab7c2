//! Per-(worker, job, task-type) sidelining set (base spec §2 "Blacklist",
//! §4.2 worker-failure handling).

use std::sync::Arc;

use anyhow::Result;

use crate::ids::{JobId, WorkerId};
use crate::model::BlacklistEntry;
use crate::store::Store;

pub struct Blacklist {
    store: Arc<dyn Store>,
}

impl Blacklist {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Blacklist { store }
    }

    pub async fn add(&self, worker: WorkerId, job: JobId, task_type: &str) -> Result<()> {
        tracing::info!(%worker, %job, task_type, "blacklisting worker for task type");
        self.store
            .blacklist_add(BlacklistEntry {
                worker_id: worker,
                job_id: job,
                task_type: task_type.to_string(),
            })
            .await
    }

    pub async fn is_blacklisted(&self, worker: WorkerId, job: JobId, task_type: &str) -> Result<bool> {
        self.store.is_blacklisted(worker, job, task_type).await
    }

    /// Workers that still could run a task of this (job, task_type): those
    /// that declare support for the type, minus the blacklist for this
    /// (job, task_type), minus `already_failed` (base spec §4.2
    /// worker-failure handling, second bullet).
    pub async fn workers_left(
        &self,
        job: JobId,
        task_type: &str,
        already_failed: &[WorkerId],
    ) -> Result<Vec<WorkerId>> {
        let candidates = self.store.workers_supporting(task_type).await?;
        let mut left = Vec::new();
        for worker in candidates {
            if already_failed.contains(&worker.id) {
                continue;
            }
            if self.store.is_blacklisted(worker.id, job, task_type).await? {
                continue;
            }
            left.push(worker.id);
        }
        Ok(left)
    }
}
