//! Blacklist entry data type (base spec §3 "Blacklist entry").

use serde::{Deserialize, Serialize};

use crate::ids::{JobId, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub task_type: String,
}
