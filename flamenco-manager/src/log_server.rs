//! Task log HTTP serving (base spec §2 "Log Server", §4.8).

use std::sync::Arc;

use anyhow::Result;

use crate::ids::{JobId, TaskId};
use crate::log_store::LogStore;

const HEAD_BYTES: usize = 5 * 1024;
const TAIL_BYTES: usize = 10 * 1024;

pub struct LogResponse {
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
}

pub struct LogServer {
    log_store: Arc<LogStore>,
}

impl LogServer {
    pub fn new(log_store: Arc<LogStore>) -> Self {
        LogServer { log_store }
    }

    /// Resolves and serves the log for (job, task). `None` means neither the
    /// plain nor the gzipped file exists.
    pub async fn serve(
        &self,
        job: JobId,
        task: TaskId,
        user_agent: &str,
    ) -> Result<Option<LogResponse>> {
        let path = self.log_store.task_log_path(job, task);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return self.serve_gzipped(&path).await;
        }

        let data = tokio::fs::read(&path).await?;
        if is_downloader(user_agent) || data.len() <= HEAD_BYTES + TAIL_BYTES {
            return Ok(Some(LogResponse {
                body: data,
                content_type: "text/plain",
                content_encoding: None,
            }));
        }

        Ok(Some(head_banner_tail(&data)))
    }

    async fn serve_gzipped(&self, plain_path: &std::path::Path) -> Result<Option<LogResponse>> {
        let mut gz_path = plain_path.as_os_str().to_owned();
        gz_path.push(".gz");
        let gz_path = std::path::PathBuf::from(gz_path);
        if !tokio::fs::try_exists(&gz_path).await.unwrap_or(false) {
            return Ok(None);
        }
        let body = tokio::fs::read(&gz_path).await?;
        Ok(Some(LogResponse {
            body,
            content_type: "text/plain",
            content_encoding: Some("gzip"),
        }))
    }
}

fn is_downloader(user_agent: &str) -> bool {
    user_agent.starts_with("Wget/") || user_agent.starts_with("curl/")
}

fn head_banner_tail(data: &[u8]) -> LogResponse {
    let head = &data[..HEAD_BYTES];
    let tail_seek = data.len() - TAIL_BYTES;
    let tail_start = match data[tail_seek..].iter().position(|&b| b == b'\n') {
        Some(offset) => tail_seek + offset + 1,
        None => tail_seek,
    };
    let tail = &data[tail_start..];
    let skipped = tail_start - HEAD_BYTES;

    let banner = format!(
        "...\n\n... Skipped {}, use WGet or Curl to download the entire log ... \n\n",
        humanize_bytes(skipped as u64)
    );

    let mut body = Vec::with_capacity(head.len() + banner.len() + tail.len());
    body.extend_from_slice(head);
    body.extend_from_slice(banner.as_bytes());
    body.extend_from_slice(tail);

    LogResponse {
        body,
        content_type: "text/plain",
        content_encoding: None,
    }
}

/// Mirrors the Go original's `humanizeByteSize`: one decimal place, binary
/// (1024-based) units.
pub fn humanize_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
