//! The cached worker document (base spec §3 "Worker").

use serde::{Deserialize, Serialize};

use crate::ids::{TaskId, WorkerId};
use crate::model::task::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Awake,
    Timeout,
    Down,
    /// Operator-only: the worker has been told to power off.
    Shutdown,
    /// Operator-only: the worker has been told to go idle without powering off.
    Asleep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Salted digest of the worker's registration secret; the plaintext is
    /// never stored (SPEC_FULL.md §B.4).
    pub secret_hash: String,
    /// Host without port.
    pub address: String,
    pub nickname: Option<String>,
    pub supported_task_types: Vec<String>,
    pub platform: String,
    pub status: WorkerStatus,
    pub last_activity: i64,
    pub current_task: Option<TaskId>,
    pub current_task_status: Option<TaskStatus>,
    pub current_task_updated: Option<i64>,
    pub software: String,
}

impl Worker {
    pub fn new(address: impl Into<String>, secret_hash: impl Into<String>) -> Self {
        Worker {
            id: WorkerId::new(),
            secret_hash: secret_hash.into(),
            address: address.into(),
            nickname: None,
            supported_task_types: Vec::new(),
            platform: String::new(),
            status: WorkerStatus::Awake,
            last_activity: proxmox_time::epoch_i64(),
            current_task: None,
            current_task_status: None,
            current_task_updated: None,
            software: String::new(),
        }
    }

    /// `"<address> (<nickname>)"` when a nickname is set, else just the
    /// address. Used in log lines throughout (SPEC_FULL.md §B.1).
    pub fn identifier(&self) -> String {
        match &self.nickname {
            Some(nick) if !nick.is_empty() => format!("{} ({nick})", self.address),
            _ => self.address.clone(),
        }
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.supported_task_types.iter().any(|t| t == task_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_includes_nickname_when_present() {
        let mut w = Worker::new("10.0.0.5", "hash");
        assert_eq!(w.identifier(), "10.0.0.5");
        w.nickname = Some("render-box-1".to_string());
        assert_eq!(w.identifier(), "10.0.0.5 (render-box-1)");
    }

    #[test]
    fn supports_checks_declared_task_types() {
        let mut w = Worker::new("10.0.0.5", "hash");
        w.supported_task_types.push("render".to_string());
        assert!(w.supports("render"));
        assert!(!w.supports("simulate"));
    }
}
