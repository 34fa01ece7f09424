//! # Server
//!
//! Owns the listening socket, the shutdown token shared by every loop, and
//! the task tracker counting the accept loop plus every connection task.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use tcp_conduit::config::ServerConfig;
//! use tcp_conduit::core::frame::Frame;
//! use tcp_conduit::protocol::callback::Callback;
//! use tcp_conduit::protocol::FrameProtocol;
//! use tcp_conduit::registry::ConnectionHub;
//! use tcp_conduit::transport::connection::Connection;
//! use tcp_conduit::transport::server::Server;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Callback<Frame> for Echo {
//!     async fn on_connect(&self, _conn: &Arc<Connection<Frame>>) -> bool {
//!         true
//!     }
//!
//!     async fn on_message(&self, conn: &Arc<Connection<Frame>>, frame: Frame) -> bool {
//!         conn.touch();
//!         conn.write_async(frame, Duration::from_secs(1)).await.is_ok()
//!     }
//!
//!     fn on_close(&self, _conn: &Connection<Frame>) {}
//! }
//!
//! # async fn run() -> std::io::Result<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:7082").await?;
//! let server = Arc::new(Server::<Frame>::new(
//!     ServerConfig::default(),
//!     Arc::new(FrameProtocol),
//!     Arc::new(Echo),
//!     Arc::new(ConnectionHub::<Frame>::default()),
//! ));
//!
//! let accept = {
//!     let server = Arc::clone(&server);
//!     tokio::spawn(async move { server.serve(listener).await })
//! };
//!
//! tokio::signal::ctrl_c().await?;
//! server.stop().await;
//! let _ = accept.await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ServerConfig;
use crate::core::packet::Packet;
use crate::error::{ConduitError, Result};
use crate::protocol::callback::Callback;
use crate::protocol::Protocol;
use crate::registry::Registry;
use crate::transport::connection::Connection;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// State shared by the server and all of its connections.
pub(crate) struct ServerContext<T: Packet> {
    pub(crate) config: ServerConfig,
    pub(crate) protocol: Arc<dyn Protocol<Packet = T>>,
    pub(crate) callback: Arc<dyn Callback<T>>,
    pub(crate) registry: Arc<dyn Registry<T>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) metrics: Arc<Metrics>,
}

pub struct Server<T: Packet> {
    ctx: Arc<ServerContext<T>>,
    next_index: AtomicU32,
}

impl<T: Packet> Server<T> {
    pub fn new(
        config: ServerConfig,
        protocol: Arc<dyn Protocol<Packet = T>>,
        callback: Arc<dyn Callback<T>>,
        registry: Arc<dyn Registry<T>>,
    ) -> Self {
        Self {
            ctx: Arc::new(ServerContext {
                config,
                protocol,
                callback,
                registry,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                metrics: Arc::new(Metrics::new()),
            }),
            next_index: AtomicU32::new(0),
        }
    }

    /// Use an externally owned shutdown token, e.g. one shared with other services.
    pub fn with_shutdown_token(self, token: CancellationToken) -> Self {
        self.map_context(|ctx| ctx.shutdown = token)
    }

    /// Use an externally owned completion tracker.
    pub fn with_task_tracker(self, tracker: TaskTracker) -> Self {
        self.map_context(|ctx| ctx.tracker = tracker)
    }

    pub fn with_metrics(self, metrics: Arc<Metrics>) -> Self {
        self.map_context(|ctx| ctx.metrics = metrics)
    }

    fn map_context(mut self, apply: impl FnOnce(&mut ServerContext<T>)) -> Self {
        match Arc::get_mut(&mut self.ctx) {
            Some(ctx) => apply(ctx),
            None => warn!("Server already started; configuration change ignored"),
        }
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.ctx.metrics)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    pub fn task_tracker(&self) -> TaskTracker {
        self.ctx.tracker.clone()
    }

    /// Number of running background units (accept loop and connection tasks).
    pub fn active_tasks(&self) -> usize {
        self.ctx.tracker.len()
    }

    /// Accept connections until [`Server::stop`] is called.
    ///
    /// Each accept attempt waits at most `accept_timeout`; an expired attempt
    /// and every accept error are retried. The listener is closed on return.
    #[instrument(skip_all, fields(local_addr = ?listener.local_addr().ok()))]
    pub async fn start(&self, listener: TcpListener, accept_timeout: Duration) {
        let _accept_loop = self.ctx.tracker.token();
        let accept_timeout = accept_timeout.max(Duration::from_millis(1));
        info!(accept_timeout_ms = accept_timeout.as_millis(), "Accept loop started");

        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => break,
                attempt = tokio::time::timeout(accept_timeout, listener.accept()) => attempt,
            };

            match attempt {
                Ok(Ok((stream, peer_addr))) => self.spawn_connection(stream, peer_addr),
                Ok(Err(e)) => warn!(error = %e, "Accept failed, retrying"),
                Err(_) => trace!("Accept wait expired"),
            }
        }

        drop(listener);
        info!("Accept loop stopped, listener closed");
    }

    /// [`Server::start`] with the configured accept timeout.
    pub async fn serve(&self, listener: TcpListener) {
        self.start(listener, self.ctx.config.accept_timeout).await
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            stream,
            peer_addr,
            index,
            Arc::clone(&self.ctx),
        ));

        self.ctx.metrics.connection_accepted();
        self.ctx.registry.register(index, Arc::clone(&conn));
        debug!(conn = index, peer = %peer_addr, "Connection accepted");

        self.ctx.tracker.spawn(conn.run());
    }

    /// Signal shutdown and wait until the accept loop and every connection
    /// task have exited.
    pub async fn stop(&self) {
        info!(active_tasks = self.ctx.tracker.len(), "Stopping server");
        self.ctx.shutdown.cancel();
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
        self.ctx.metrics.log_metrics();
        info!("Server stopped");
    }

    /// [`Server::stop`], giving up after `limit`.
    pub async fn stop_timeout(&self, limit: Duration) -> Result<()> {
        let stopped = with_timeout_error(
            async {
                self.stop().await;
                Ok(())
            },
            limit,
            ConduitError::Timeout,
        )
        .await;
        if stopped.is_err() {
            warn!(
                remaining = self.ctx.tracker.len(),
                "Shutdown timeout reached with tasks still running"
            );
        }
        stopped
    }

    /// [`Server::stop_timeout`] bounded by the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_timeout(self.ctx.config.shutdown_timeout).await
    }
}
