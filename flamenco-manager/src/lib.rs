//! Task-scheduling and task-update middle tier of the Flamenco render-farm
//! stack (base spec §1). This crate is the core described there: worker
//! registry, blacklist, task-update queue and pusher, scheduler, worker
//! remover and log server. Everything base spec §1 calls out as an external
//! collaborator (embedded database, upstream HTTP client, bearer-token auth,
//! file store, filesystem watcher, config loading, operator UI) is
//! represented here only as the trait boundary it needs (`store`,
//! `upstream`), per SPEC_FULL.md §C.

pub mod blacklist;
pub mod clock;
pub mod closable;
pub mod config;
pub mod error;
pub mod http;
pub mod ids;
pub mod log_server;
pub mod log_store;
pub mod model;
pub mod pusher;
pub mod scheduler;
pub mod store;
pub mod task_updates;
pub mod upstream;
pub mod varrepl;
pub mod worker_remover;
pub mod workers;

use std::sync::Arc;

use crate::blacklist::Blacklist;
use crate::clock::Clock;
use crate::config::ManagerConfig;
use crate::log_server::LogServer;
use crate::log_store::LogStore;
use crate::pusher::TaskUpdatePusher;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::task_updates::TaskUpdateQueue;
use crate::upstream::UpstreamClient;
use crate::worker_remover::WorkerRemover;
use crate::workers::WorkerRegistry;

/// Every long-running piece wired together: the scheduler, worker registry
/// and task-update queue from `scheduler.go`/`workers.go`/`task_updates.go`,
/// plus the pusher and worker remover each run as their own background loop.
/// Holding this keeps all the `Arc`s (and, via `Closable`, all the
/// background loops) alive for the life of the process.
pub struct Manager {
    pub config: ManagerConfig,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub blacklist: Arc<Blacklist>,
    pub log_store: Arc<LogStore>,
    pub log_server: Arc<LogServer>,
    pub workers: Arc<WorkerRegistry>,
    pub task_updates: Arc<TaskUpdateQueue>,
    pub scheduler: Arc<Scheduler>,
    pusher: Option<TaskUpdatePusher>,
    remover: Option<WorkerRemover>,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        let blacklist = Arc::new(Blacklist::new(store.clone()));
        let log_store = Arc::new(LogStore::new(config.task_logs_path.clone()));
        let log_server = Arc::new(LogServer::new(log_store.clone()));
        let workers = Arc::new(WorkerRegistry::new(store.clone(), clock.clone()));
        let task_updates = Arc::new(TaskUpdateQueue::new(
            store.clone(),
            blacklist.clone(),
            log_store.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            workers.clone(),
            upstream.clone(),
            config.clone(),
        ));

        Manager {
            config,
            store,
            clock,
            blacklist,
            log_store,
            log_server,
            workers,
            task_updates,
            scheduler,
            pusher: None,
            remover: None,
        }
    }

    /// Starts the two background loops this crate owns outright (base spec
    /// §2 "Closable": `Go()`). The scheduler has no loop of its own — it
    /// runs inline per request — so only the pusher and (conditionally) the
    /// remover are started here.
    pub fn go(&mut self, store_for_loops: Arc<dyn Store>, upstream: Arc<dyn UpstreamClient>, file_uploader: Arc<dyn crate::upstream::FileUploader>) {
        self.pusher = Some(TaskUpdatePusher::spawn_with_clock(
            store_for_loops.clone(),
            self.task_updates.clone(),
            upstream,
            file_uploader,
            self.config.clone(),
            self.clock.clone(),
        ));

        if self.config.worker_cleanup_enabled() {
            self.remover = Some(WorkerRemover::spawn(
                store_for_loops,
                self.task_updates.clone(),
                self.clock.clone(),
                self.config.clone(),
            ));
        }
    }

    /// A handle the HTTP layer can notify to force an immediate push,
    /// without needing shared ownership of the pusher itself (base spec
    /// §4.4 step 2 "forced by a kick").
    pub fn pusher_kick_handle(&self) -> Option<Arc<tokio::sync::Notify>> {
        self.pusher.as_ref().map(TaskUpdatePusher::kick_handle)
    }

    /// Signals every background loop to stop and waits for them (base spec
    /// §5 "Cancellation semantics").
    pub async fn close(&mut self) {
        if let Some(pusher) = &mut self.pusher {
            pusher.close().await;
        }
        if let Some(remover) = &mut self.remover {
            remover.close().await;
        }
    }
}
