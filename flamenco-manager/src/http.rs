//! Worker- and operator-facing HTTP surface (base spec §2 "Glue", 10% of
//! the core; contracts in base spec §6). Thin by design: every handler
//! below is a few lines of request parsing around a call into one of the
//! core components — no business logic lives here.
//!
//! Bearer-token authentication proper is out of scope (base spec §1); the
//! worker-identity check this layer needs (base spec §6 "digest auth keyed
//! by worker id + hashed secret") is implemented as HTTP Basic auth with
//! the worker id as username and its registration secret as password,
//! verified against [`WorkerRegistry::verify_secret`]'s stored hash. This
//! is the concrete representation SPEC_FULL.md and DESIGN.md settle on for
//! that contract; a production deployment can swap in real digest auth
//! behind the same [`authenticate`] seam without touching any handler.

use std::sync::{Arc, LazyLock};

use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use proxmox_http::Body;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ManagerError;
use crate::ids::{JobId, TaskId, WorkerId};
use crate::model::task::TaskStatus;
use crate::model::update::TaskUpdate;
use crate::scheduler::Assignment;
use crate::store::TaskPatch;
use crate::task_updates::TaskUpdateQueue;
use crate::workers::WorkerRegistry;

/// Everything a request handler needs: the core components, wired up once
/// at startup and shared behind `Arc` across every connection.
pub struct AppState {
    pub workers: Arc<WorkerRegistry>,
    pub scheduler: Arc<crate::scheduler::Scheduler>,
    pub task_updates: Arc<TaskUpdateQueue>,
    pub log_server: Arc<crate::log_server::LogServer>,
    /// Notified after a task update is queued so the pusher doesn't have to
    /// wait out a full tick to notice high-priority traffic (cancel acks,
    /// failures). Obtained from `Manager::pusher_kick_handle`. Optional:
    /// tests can wire a `None` state.
    pub pusher_kick: Option<Arc<tokio::sync::Notify>>,
}

static TASK_UPDATE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/tasks/([0-9a-f]{24})/update$").unwrap());
static MAY_I_RUN_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/may-i-run/([0-9a-f]{24})$").unwrap());
static LOGFILE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/logfile/([0-9a-f]{24})/([0-9a-f]{24})$").unwrap());

pub async fn dispatch(
    state: &AppState,
    req: Request<Incoming>,
    peer_host: &str,
) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user_agent = header_str(&req, "user-agent").unwrap_or_default();

    let result = route(state, &method, &path, req, peer_host, &user_agent).await;
    match result {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, %method, %path, "request failed");
            error_response(&err)
        }
    }
}

async fn route(
    state: &AppState,
    method: &Method,
    path: &str,
    req: Request<Incoming>,
    peer_host: &str,
    user_agent: &str,
) -> Result<Response<Body>, ManagerError> {
    match (method, path) {
        (&Method::POST, "/register-worker") => register_worker(state, req, peer_host).await,
        (&Method::POST, "/sign-on") => {
            let (worker_id, _) = authenticate(state, &req).await?;
            sign_on(state, worker_id, req, peer_host, user_agent).await
        }
        (&Method::POST, "/sign-off") => {
            let (worker_id, _) = authenticate(state, &req).await?;
            sign_off(state, worker_id, peer_host, user_agent).await
        }
        (&Method::POST, "/task") => {
            let (worker_id, _) = authenticate(state, &req).await?;
            claim_task(state, worker_id, peer_host, user_agent).await
        }
        (&Method::GET, p) if MAY_I_RUN_PATH.is_match(p) => {
            let (worker_id, _) = authenticate(state, &req).await?;
            let task_id: TaskId = MAY_I_RUN_PATH.captures(p).unwrap()[1].parse().map_err(bad_request)?;
            may_i_run(state, worker_id, task_id).await
        }
        (&Method::POST, p) if TASK_UPDATE_PATH.is_match(p) => {
            let (worker_id, _) = authenticate(state, &req).await?;
            let task_id: TaskId = TASK_UPDATE_PATH.captures(p).unwrap()[1].parse().map_err(bad_request)?;
            submit_task_update(state, worker_id, task_id, req).await
        }
        (&Method::GET, p) if LOGFILE_PATH.is_match(p) => {
            let caps = LOGFILE_PATH.captures(p).unwrap();
            let job: JobId = caps[1].parse().map_err(bad_request)?;
            let task: TaskId = caps[2].parse().map_err(bad_request)?;
            serve_logfile(state, job, task, user_agent).await
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("building a fixed not-found response never fails")),
    }
}

/// HTTP Basic auth, worker id as username, registration secret as password
/// (base spec §6, see module docs).
async fn authenticate(state: &AppState, req: &Request<Incoming>) -> Result<(WorkerId, String), ManagerError> {
    let header = header_str(req, "authorization").ok_or(ManagerError::UnknownWorker)?;
    let encoded = header.strip_prefix("Basic ").ok_or(ManagerError::UnknownWorker)?;
    let decoded = proxmox_base64::decode(encoded).map_err(|_| ManagerError::UnknownWorker)?;
    let text = String::from_utf8(decoded).map_err(|_| ManagerError::UnknownWorker)?;
    let (id_str, secret) = text.split_once(':').ok_or(ManagerError::UnknownWorker)?;
    let worker_id: WorkerId = id_str.parse().map_err(|_| ManagerError::UnknownWorker)?;

    if !state
        .workers
        .verify_secret(worker_id, secret)
        .await?
    {
        return Err(ManagerError::UnknownWorker);
    }
    Ok((worker_id, secret.to_string()))
}

#[derive(Deserialize)]
struct RegisterWorkerRequest {
    secret: String,
}

async fn register_worker(
    state: &AppState,
    req: Request<Incoming>,
    peer_host: &str,
) -> Result<Response<Body>, ManagerError> {
    let body: RegisterWorkerRequest = read_json(req).await?;
    let worker = state.workers.register(peer_host, &body.secret).await?;
    json_response(StatusCode::OK, &worker)
}

#[derive(Deserialize)]
struct SignOnRequest {
    supported_task_types: Vec<String>,
    nickname: Option<String>,
}

async fn sign_on(
    state: &AppState,
    worker_id: WorkerId,
    req: Request<Incoming>,
    peer_host: &str,
    user_agent: &str,
) -> Result<Response<Body>, ManagerError> {
    state.workers.mark_seen(worker_id, peer_host, user_agent).await?;
    let body: SignOnRequest = read_json(req).await?;
    state
        .workers
        .sign_on(worker_id, body.supported_task_types, body.nickname)
        .await?
        .ok_or(ManagerError::UnknownWorker)?;
    Ok(no_content())
}

async fn sign_off(
    state: &AppState,
    worker_id: WorkerId,
    peer_host: &str,
    user_agent: &str,
) -> Result<Response<Body>, ManagerError> {
    state.workers.mark_seen(worker_id, peer_host, user_agent).await?;
    state.workers.sign_off(&state.task_updates, worker_id).await?;
    if let Some(kick) = &state.pusher_kick {
        kick.notify_one();
    }
    Ok(no_content())
}

async fn claim_task(
    state: &AppState,
    worker_id: WorkerId,
    peer_host: &str,
    user_agent: &str,
) -> Result<Response<Body>, ManagerError> {
    match state.scheduler.assign_task(worker_id, peer_host, user_agent).await? {
        Assignment::Task(task) => json_response(StatusCode::OK, &task),
        Assignment::NoTasks => Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .expect("fixed response")),
    }
}

#[derive(Serialize)]
struct MayIRunResponse {
    may_keep_running: bool,
    reason: String,
}

async fn may_i_run(
    state: &AppState,
    worker_id: WorkerId,
    task_id: TaskId,
) -> Result<Response<Body>, ManagerError> {
    let (may_keep_running, reason) = state.workers.may_i_run(worker_id, task_id).await?;
    json_response(StatusCode::OK, &MayIRunResponse { may_keep_running, reason })
}

/// Request body for `POST /tasks/{id}/update` (base spec §3 "Task Update",
/// the subset a worker is allowed to propose).
#[derive(Deserialize)]
struct TaskUpdateRequest {
    task_status: Option<TaskStatus>,
    activity: Option<String>,
    progress_percent: Option<u8>,
    current_command_idx: Option<u32>,
    command_progress: Option<u8>,
    log: Option<String>,
}

async fn submit_task_update(
    state: &AppState,
    worker_id: WorkerId,
    task_id: TaskId,
    req: Request<Incoming>,
) -> Result<Response<Body>, ManagerError> {
    let body: TaskUpdateRequest = read_json(req).await?;

    let task = state
        .task_updates
        .store()
        .get_task(task_id)
        .await?
        .ok_or(ManagerError::UnknownTask)?;
    if task.worker_id != Some(worker_id) {
        return Err(ManagerError::WrongWorker);
    }

    // base spec §4.2 "Ignoring worker noise": a non-runnable current status
    // (cancel-requested, already failed, ...) can never be overwritten by a
    // worker, but the update is still queued and its activity/log still
    // applied — `queue_task_update`'s `can_transition_to` check is what
    // actually drops the proposed status.
    let mut update = TaskUpdate::from_worker(task_id, task.job, worker_id);
    update.new_status = body.task_status;
    update.activity = body.activity;
    update.progress_percent = body.progress_percent;
    update.current_command_idx = body.current_command_idx;
    update.command_progress = body.command_progress;
    update.log = body.log;

    let is_failure = body.task_status == Some(TaskStatus::Failed);
    let mut extra = TaskPatch::new();
    if let Some(pct) = update.progress_percent {
        extra = extra.set("progress_percent", pct);
    }
    if let Some(idx) = update.current_command_idx {
        extra = extra.set("current_command_idx", idx);
    }
    if let Some(pct) = update.command_progress {
        extra = extra.set("command_progress", pct);
    }
    if is_failure {
        extra = extra.push("failed_by_workers", worker_id.to_string());
    }

    state.task_updates.queue_task_update(update, extra).await?;
    state.workers.ping_task(worker_id, task_id, body.task_status).await?;
    if let Some(kick) = &state.pusher_kick {
        if is_failure {
            kick.notify_one();
        }
    }

    Ok(no_content())
}

async fn serve_logfile(
    state: &AppState,
    job: JobId,
    task: TaskId,
    user_agent: &str,
) -> Result<Response<Body>, ManagerError> {
    let Some(log) = state.log_server.serve(job, task, user_agent).await? else {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("fixed response"));
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", log.content_type);
    if let Some(encoding) = log.content_encoding {
        builder = builder.header("content-encoding", encoding);
    }
    Ok(builder
        .body(Body::from(log.body))
        .map_err(|err| ManagerError::Internal(err.into()))?)
}

fn header_str<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers().get(name)?.to_str().ok()
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Result<T, ManagerError> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|err| ManagerError::Internal(anyhow::anyhow!("reading request body: {err}")))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|err| ManagerError::Internal(anyhow::anyhow!("invalid request body: {err}")))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>, ManagerError> {
    let body = serde_json::to_vec(value).map_err(|err| ManagerError::Internal(err.into()))?;
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .map_err(|err| ManagerError::Internal(err.into()))
}

fn no_content() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .expect("building a fixed no-content response never fails")
}

fn bad_request(err: impl std::fmt::Display) -> ManagerError {
    ManagerError::Internal(anyhow::anyhow!("{err}"))
}

fn error_response(err: &ManagerError) -> Response<Body> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(err.to_string().into_bytes()))
        .expect("building an error response from a fixed status/body never fails")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_update_path_extracts_task_id() {
        let id = TaskId::new();
        let path = format!("/tasks/{id}/update");
        assert!(TASK_UPDATE_PATH.is_match(&path));
        let caps = TASK_UPDATE_PATH.captures(&path).unwrap();
        assert_eq!(&caps[1], id.to_string().as_str());
    }

    #[test]
    fn logfile_path_extracts_job_and_task() {
        let job = JobId::new();
        let task = TaskId::new();
        let path = format!("/logfile/{job}/{task}");
        assert!(LOGFILE_PATH.is_match(&path));
        let caps = LOGFILE_PATH.captures(&path).unwrap();
        assert_eq!(&caps[1], job.to_string().as_str());
        assert_eq!(&caps[2], task.to_string().as_str());
    }

    #[test]
    fn unrelated_paths_do_not_match() {
        assert!(!TASK_UPDATE_PATH.is_match("/tasks/not-an-id/update"));
        assert!(!MAY_I_RUN_PATH.is_match("/may-i-run/"));
    }
}
