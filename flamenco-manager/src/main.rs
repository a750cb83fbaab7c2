//! Process entry point: wires the core components together, binds the
//! worker/operator HTTP surface, and runs until asked to shut down.
//!
//! Everything below is the minimum needed to stand the crate's core up as a
//! real service; the collaborators base spec §1 calls out as out of scope
//! (embedded database, upstream HTTP client, auth, file store, filesystem
//! watcher, config-file loading, operator UI) are stubbed with the
//! in-memory/no-op implementations this crate ships for its own tests —
//! a production deployment replaces [`store::memory::MemoryStore`] and
//! [`upstream::NullUpstream`] with real backends without touching the core.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;

use flamenco_manager::clock::SystemClock;
use flamenco_manager::config::ManagerConfig;
use flamenco_manager::http::{self, AppState};
use flamenco_manager::store::memory::MemoryStore;
use flamenco_manager::upstream::{NullFileUploader, NullUpstream};
use flamenco_manager::Manager;

fn main() -> Result<()> {
    proxmox_log::Logger::from_env("RUST_LOG", proxmox_log::LevelFilter::INFO)
        .stderr()
        .init()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run())
}

async fn run() -> Result<()> {
    let config = ManagerConfig::default();
    let listen = config.listen.clone();

    let store: Arc<dyn flamenco_manager::store::Store> = Arc::new(MemoryStore::new());
    let clock = Arc::new(SystemClock);
    let upstream: Arc<dyn flamenco_manager::upstream::UpstreamClient> = Arc::new(NullUpstream);
    let uploader: Arc<dyn flamenco_manager::upstream::FileUploader> = Arc::new(NullFileUploader);

    let mut manager = Manager::new(config, store.clone(), clock, upstream.clone());
    manager.go(store, upstream, uploader);
    let manager = Arc::new(manager);

    proxmox_daemon::catch_shutdown_signal(future::pending())
        .context("installing shutdown signal handler")?;

    let addr: std::net::SocketAddr = parse_listen(&listen)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "flamenco-manager listening");

    let graceful = GracefulShutdown::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let manager = manager.clone();
                        let watcher = graceful.watcher();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let peer_host = peer.ip().to_string();
                            let service = service_fn(move |req| {
                                let manager = manager.clone();
                                let peer_host = peer_host.clone();
                                handle(manager, req, peer_host)
                            });
                            let conn = auto::Builder::new(TokioExecutor::new())
                                .serve_connection(io, service);
                            if let Err(err) = conn.await {
                                tracing::debug!(error = %err, "connection ended with error");
                            }
                            drop(watcher);
                        });
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to accept connection"),
                }
            }
            _ = proxmox_daemon::shutdown_future() => {
                tracing::info!("shutdown requested, draining connections");
                break;
            }
        }
    }

    graceful.shutdown().await;
    match Arc::try_unwrap(manager) {
        Ok(mut manager) => manager.close().await,
        Err(manager) => tracing::warn!(
            refs = Arc::strong_count(&manager),
            "manager still referenced at shutdown, background loops left running"
        ),
    }
    Ok(())
}

fn handle(
    manager: Arc<Manager>,
    req: hyper::Request<hyper::body::Incoming>,
    peer_host: String,
) -> Pin<Box<dyn Future<Output = Result<hyper::Response<proxmox_http::Body>, Infallible>> + Send>> {
    Box::pin(async move {
        let state = AppState {
            workers: manager.workers.clone(),
            scheduler: manager.scheduler.clone(),
            task_updates: manager.task_updates.clone(),
            log_server: manager.log_server.clone(),
            pusher_kick: manager.pusher_kick_handle(),
        };
        Ok(http::dispatch(&state, req, &peer_host).await)
    })
}

/// `settings.go`'s `Listen` is a bare `:port` or `host:port` string; accept
/// both, defaulting the host to all interfaces.
fn parse_listen(listen: &str) -> Result<std::net::SocketAddr> {
    let with_host = if let Some(port) = listen.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen.to_string()
    };
    with_host
        .parse()
        .with_context(|| format!("invalid listen address {listen:?}"))
}
