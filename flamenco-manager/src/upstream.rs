//! Upstream coordinator collaborator boundary (base spec §1 "the upstream
//! HTTP client" — explicitly out of scope as a concrete implementation).
//!
//! The scheduler (§4.1 steps 3b/3c) and the pusher (§4.4) only need a
//! narrow async seam; production wiring of the real Flamenco Server HTTP
//! client lives outside this crate.

use anyhow::Result;
use async_trait::async_trait;

use crate::ids::{EnvelopeId, TaskId};
use crate::model::task::Task;
use crate::model::update::TaskUpdate;

/// What upstream says after a batch push (base spec §4.4 step 4).
#[derive(Debug, Default, Clone)]
pub struct PushResponse {
    pub handled_ids: Vec<EnvelopeId>,
    pub cancel_task_ids: Vec<TaskId>,
    pub upload_file_requests: Vec<UploadFileRequest>,
}

#[derive(Debug, Clone)]
pub struct UploadFileRequest {
    pub task_id: TaskId,
    pub file_path: String,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fire-and-forget hint that the Manager has run out of tasks to hand
    /// out and would like upstream to push more (base spec §4.1 step 3b).
    async fn kick_task_downloader(&self);

    /// Ask whether upstream holds a newer copy of this task than the one
    /// just claimed; `Ok(Some(task))` means the caller must overwrite its
    /// local copy and retry (base spec §4.1 step 3c).
    async fn refetch_task(&self, task_id: TaskId) -> Result<Option<Task>>;

    /// Push one batch of queued updates (base spec §4.4 steps 3-4).
    async fn push_updates(&self, batch: &[TaskUpdate]) -> Result<PushResponse>;
}

/// Fire-and-forget hand-off to the (also out of scope) content-addressed
/// file store for uploading rendered-output logs upstream asked for (base
/// spec §4.4 step 7).
#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn upload(&self, request: UploadFileRequest);
}

/// Upstream is unreachable: scheduler refetches never find anything newer,
/// pushes always succeed with an empty response. Useful for tests and for
/// running the Manager against no upstream at all.
#[derive(Default)]
pub struct NullUpstream;

#[async_trait]
impl UpstreamClient for NullUpstream {
    async fn kick_task_downloader(&self) {}

    async fn refetch_task(&self, _task_id: TaskId) -> Result<Option<Task>> {
        Ok(None)
    }

    async fn push_updates(&self, _batch: &[TaskUpdate]) -> Result<PushResponse> {
        Ok(PushResponse::default())
    }
}

#[derive(Default)]
pub struct NullFileUploader;

#[async_trait]
impl FileUploader for NullFileUploader {
    async fn upload(&self, request: UploadFileRequest) {
        tracing::debug!(task_id = %request.task_id, path = %request.file_path, "discarding upload (no uploader configured)");
    }
}
