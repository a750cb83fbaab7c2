//! On-disk task log files: layout, appending and rotation (base spec §4.2
//! step 6, §4.2.1, §6 "on-disk layout").

use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::ids::{JobId, TaskId};

/// How many rotated siblings (`.txt.1`, `.txt.2`, ...) to keep. The base
/// spec calls this "a small implementation-defined depth."
const MAX_ROTATED_GENERATIONS: u32 = 5;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

pub struct LogStore {
    root: PathBuf,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LogStore { root: root.into() }
    }

    /// `<root>/job-<jobHex[0:4]>/<jobHex>/task-<taskHex>.txt`
    pub fn task_log_path(&self, job: JobId, task: TaskId) -> PathBuf {
        self.root
            .join(format!("job-{}", job.hex_prefix4()))
            .join(job.to_string())
            .join(format!("task-{task}.txt"))
    }

    /// Appends `fragment` to the task's log file, creating parent
    /// directories as needed, ensuring the fragment ends with a newline.
    /// Skipped entirely when `job` is the "unknown job" sentinel (base spec
    /// §4.2 step 6).
    pub async fn append(&self, job: JobId, task: TaskId, fragment: &str) -> Result<()> {
        if job.is_unknown() {
            return Ok(());
        }
        if fragment.is_empty() {
            return Ok(());
        }

        let path = self.task_log_path(job, task);
        let dir = path.parent().expect("task log path always has a parent");
        create_dir_with_mode(dir).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(FILE_MODE)
            .open(&path)
            .await
            .with_context(|| format!("opening task log {}", path.display()))?;

        file.write_all(fragment.as_bytes()).await?;
        if !fragment.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        Ok(())
    }

    /// Renames the current log to `.1`, shifting any existing rotated
    /// siblings up a generation, dropping the oldest beyond
    /// [`MAX_ROTATED_GENERATIONS`]. Errors on any single rename are logged
    /// and otherwise ignored -- rotation never blocks a status transition
    /// (base spec §7).
    pub async fn rotate(&self, job: JobId, task: TaskId) -> Result<()> {
        if job.is_unknown() {
            return Ok(());
        }
        let base = self.task_log_path(job, task);
        if !tokio::fs::try_exists(&base).await.unwrap_or(false) {
            return Ok(());
        }

        for generation in (1..MAX_ROTATED_GENERATIONS).rev() {
            let from = rotated_path(&base, generation);
            let to = rotated_path(&base, generation + 1);
            if tokio::fs::try_exists(&from).await.unwrap_or(false) {
                if let Err(err) = tokio::fs::rename(&from, &to).await {
                    tracing::warn!(error = %err, from = %from.display(), to = %to.display(), "log rotation rename failed");
                }
            }
        }

        let first = rotated_path(&base, 1);
        if let Err(err) = tokio::fs::rename(&base, &first).await {
            tracing::warn!(error = %err, path = %base.display(), "log rotation of active log failed");
        }
        Ok(())
    }
}

fn rotated_path(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

async fn create_dir_with_mode(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let perms = std::fs::Permissions::from_mode(DIR_MODE);
    tokio::fs::set_permissions(dir, perms).await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_creates_directories_and_ensures_trailing_newline() {
        let dir = tempfile_dir();
        let store = LogStore::new(&dir);
        let job = JobId::new();
        let task = TaskId::new();

        store.append(job, task, "no newline here").await.unwrap();

        let contents = tokio::fs::read_to_string(store.task_log_path(job, task))
            .await
            .unwrap();
        assert_eq!(contents, "no newline here\n");
    }

    #[tokio::test]
    async fn append_is_skipped_for_unknown_job() {
        let dir = tempfile_dir();
        let store = LogStore::new(&dir);
        let task = TaskId::new();

        store.append(JobId::UNKNOWN, task, "irrelevant").await.unwrap();

        assert!(!tokio::fs::try_exists(store.task_log_path(JobId::UNKNOWN, task))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rotate_renames_active_log_to_dot_one() {
        let dir = tempfile_dir();
        let store = LogStore::new(&dir);
        let job = JobId::new();
        let task = TaskId::new();

        store.append(job, task, "first run").await.unwrap();
        store.rotate(job, task).await.unwrap();

        assert!(!tokio::fs::try_exists(store.task_log_path(job, task))
            .await
            .unwrap());
        let rotated = rotated_path(&store.task_log_path(job, task), 1);
        assert!(tokio::fs::try_exists(&rotated).await.unwrap());
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("flamenco-manager-test-{}", TaskId::new()));
        dir
    }
}
