//! HTTP-boundary error type (SPEC_FULL.md §A.2).
//!
//! Mirrors `proxmox_router::HttpError`'s split: internal code returns
//! `anyhow::Result`, and only the glue layer needs to know which failures
//! map to which status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown worker")]
    UnknownWorker,

    #[error("unknown task")]
    UnknownTask,

    #[error("task is assigned to a different worker")]
    WrongWorker,

    #[error("scheduler livelock: exhausted refetch attempts")]
    SchedulerLivelock,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ManagerError {
    /// Mirrors `HttpError`'s carried status code (base spec §7).
    pub fn status_code(&self) -> u16 {
        match self {
            ManagerError::UnknownWorker => 401,
            ManagerError::UnknownTask => 404,
            ManagerError::WrongWorker => 403,
            ManagerError::SchedulerLivelock => 500,
            ManagerError::Internal(_) => 500,
        }
    }
}
