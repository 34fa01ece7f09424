//! # Connection
//!
//! The per-socket unit of concurrency.
//!
//! An admitted connection runs five tasks on the server's task tracker:
//!
//! ```text
//!            socket ──► read loop ──► inbound queue ──► dispatch loop ──► Callback::on_message
//!                                          │
//!                                          └──────────► read_async (application)
//! write_async ──► outbound queue ──► write loop ─────────┐
//! write_from_broker ──► broker queue ──► broker write loop ─┴──► socket
//!                     heartbeat loop (idle check on every tick)
//! ```
//!
//! Every task races the server shutdown token and the connection's own close
//! token, and every way a task can end (normal return, error, panic) funnels
//! into [`Connection::close`], which runs its teardown exactly once.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

use crate::config::BROKER_QUEUE_CAPACITY;
use crate::core::packet::Packet;
use crate::core::queue::BoundedQueue;
use crate::error::{ConduitError, Result};
use crate::protocol::ByteSource;
use crate::transport::server::ServerContext;

type ExtraData = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum WriteSource {
    Application,
    Broker,
}

pub struct Connection<T: Packet> {
    index: u32,
    peer_addr: SocketAddr,
    ctx: Arc<ServerContext<T>>,
    span: Span,

    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,

    outbound: BoundedQueue<T>,
    inbound: BoundedQueue<T>,
    broker_outbound: BoundedQueue<T>,

    closed: AtomicBool,
    close_token: CancellationToken,

    identifier: RwLock<Option<String>>,
    topic: RwLock<Option<String>>,
    // last activity, as milliseconds since `epoch`
    epoch: Instant,
    last_activity_ms: AtomicU64,
    extra: Mutex<Option<ExtraData>>,
}

impl<T: Packet> Connection<T> {
    pub(crate) fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        index: u32,
        ctx: Arc<ServerContext<T>>,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let span = info_span!("conn", conn = index, peer = %peer_addr);
        Self {
            index,
            peer_addr,
            span,
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            outbound: BoundedQueue::new(ctx.config.packet_send_limit),
            inbound: BoundedQueue::new(ctx.config.packet_receive_limit),
            broker_outbound: BoundedQueue::new(BROKER_QUEUE_CAPACITY),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            identifier: RwLock::new(None),
            topic: RwLock::new(None),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            extra: Mutex::new(None),
            ctx,
        }
    }

    /// Index assigned at accept time, unique within one server run.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the close routine has started.
    pub async fn closed(&self) {
        self.close_token.cancelled().await
    }

    pub fn identifier(&self) -> Option<String> {
        self.identifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the application identifier without touching the registry.
    pub fn set_identifier(&self, identifier: impl Into<String>) {
        *self.identifier.write().unwrap_or_else(PoisonError::into_inner) = Some(identifier.into());
    }

    /// Record the application identifier and bind it in the registry, making
    /// the connection reachable through `Registry::lookup`.
    pub fn bind_identifier(&self, identifier: impl Into<String>) -> Result<()> {
        if self.is_closed() {
            return Err(ConduitError::ConnectionClosing);
        }
        let identifier = identifier.into();
        // recorded before binding so a concurrent close deregisters it
        self.set_identifier(identifier.clone());
        self.ctx.registry.bind(&identifier, self.index);

        if self.is_closed() {
            // close ran before the binding landed and could not remove it
            self.ctx.registry.deregister(self.index, Some(&identifier));
            return Err(ConduitError::ConnectionClosing);
        }
        debug!(conn = self.index, identifier = %identifier, "Identifier bound");
        Ok(())
    }

    pub fn topic(&self) -> Option<String> {
        self.topic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_topic(&self, topic: impl Into<String>) {
        *self.topic.write().unwrap_or_else(PoisonError::into_inner) = Some(topic.into());
    }

    /// Mark the connection as alive now. Called by protocol-specific logic
    /// when it recognises an application heartbeat.
    pub fn touch(&self) {
        self.set_last_activity(Instant::now());
    }

    pub fn set_last_activity(&self, at: Instant) {
        let millis = at.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_activity_ms.store(millis, Ordering::Release);
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.epoch + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        Instant::now().saturating_duration_since(last)
    }

    /// Attach an application value, replacing any previous one.
    pub fn put_extra_data<D: Any + Send + Sync>(&self, data: D) {
        *self.extra.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(data));
    }

    /// The attached value, if one of type `D` is present.
    pub fn extra_data<D: Any + Send + Sync>(&self) -> Option<Arc<D>> {
        let data = self
            .extra
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        data.downcast::<D>().ok()
    }

    /// Forward data to the broker through the registry.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.ctx.registry.publish(topic, payload.into())
    }

    /// Take the next framed packet. A zero `timeout` never waits.
    pub async fn read_async(&self, timeout: Duration) -> Result<T> {
        if self.is_closed() {
            return Err(ConduitError::ConnectionClosing);
        }
        self.inbound.pop_timeout(timeout).await
    }

    /// Queue a packet for the socket. A zero `timeout` never waits.
    pub async fn write_async(&self, packet: T, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(ConduitError::ConnectionClosing);
        }
        self.outbound.push_timeout(packet, timeout).await
    }

    /// Queue a broker-originated packet for the socket. Uses its own queue so
    /// broker and application traffic are bounded independently.
    pub async fn write_from_broker(&self, packet: T, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(ConduitError::ConnectionClosing);
        }
        self.broker_outbound.push_timeout(packet, timeout).await
    }

    /// Tear the connection down. Safe to call any number of times from any
    /// task; only the first call has an effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.close_token.cancel();
        self.outbound.close();
        self.inbound.close();
        self.broker_outbound.close();

        // halves still held by a running loop are dropped when that loop exits
        drop(self.take_reader());
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        let identifier = self.identifier();
        self.ctx.registry.deregister(self.index, identifier.as_deref());
        self.ctx.metrics.connection_closed();
        info!(conn = self.index, peer = %self.peer_addr, identifier = ?identifier, "Connection closed");

        self.ctx.callback.on_close(self);
    }

    /// Admission, then the five loops.
    pub(crate) async fn run(self: Arc<Self>) {
        let span = self.span.clone();
        async move {
            let admitted = match AssertUnwindSafe(self.ctx.callback.on_connect(&self))
                .catch_unwind()
                .await
            {
                Ok(admitted) => admitted,
                Err(_) => {
                    error!("Admission hook panicked");
                    self.ctx.metrics.loop_panic();
                    false
                }
            };

            if !admitted {
                info!("Connection rejected by admission hook");
                self.ctx.metrics.connection_rejected();
                self.close();
                return;
            }

            self.spawn_loop("read", Arc::clone(&self).read_loop());
            self.spawn_loop("write", Arc::clone(&self).write_loop(WriteSource::Application));
            self.spawn_loop("dispatch", Arc::clone(&self).dispatch_loop());
            self.spawn_loop("broker_write", Arc::clone(&self).write_loop(WriteSource::Broker));
            self.spawn_loop("heartbeat", Arc::clone(&self).heartbeat_loop());
        }
        .instrument(span)
        .await
    }

    fn spawn_loop<F>(self: &Arc<Self>, name: &'static str, body: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let conn = Arc::clone(self);
        let task = async move {
            match AssertUnwindSafe(body).catch_unwind().await {
                Ok(Ok(())) => trace!(task = name, "Loop finished"),
                Ok(Err(e)) => conn.record_loop_error(name, &e),
                Err(_) => {
                    error!(task = name, "Loop panicked");
                    conn.ctx.metrics.loop_panic();
                }
            }
            conn.close();
            conn.writer.lock().await.take();
        };
        self.ctx.tracker.spawn(task.instrument(self.span.clone()));
    }

    fn record_loop_error(&self, name: &'static str, err: &ConduitError) {
        match err {
            ConduitError::ConnectionTimeout => {
                let idle = self.idle_for();
                info!(task = name, idle_ms = idle.as_millis(), "Heartbeat expired");
                self.ctx.metrics.heartbeat_expiry();
            }
            ConduitError::PeerClosed | ConduitError::ConnectionClosing => {
                debug!(task = name, error = %err, "Loop ended");
            }
            _ => {
                warn!(task = name, error = %err, "Loop failed");
                self.ctx.metrics.connection_error();
            }
        }
    }

    /// Run `fut` unless the server shuts down or this connection closes first.
    /// Both signals are checked before `fut` is polled.
    async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.ctx.shutdown.cancelled() => None,
            _ = self.close_token.cancelled() => None,
            out = fut => Some(out),
        }
    }

    fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn read_loop(self: Arc<Self>) -> Result<()> {
        let reader = self.take_reader().ok_or(ConduitError::ConnectionClosing)?;
        let mut source =
            ByteSource::new(reader, self.ctx.config.read_chunk_size).with_peer_addr(self.peer_addr);

        loop {
            let Some(framed) = self
                .until_cancelled(self.ctx.protocol.read_packet(&mut source))
                .await
            else {
                return Ok(());
            };

            let packet = match framed {
                Ok(packet) => packet,
                Err(ConduitError::IncompleteFrame) => continue,
                Err(e) => return Err(e),
            };
            self.ctx.metrics.packet_received();

            // a full inbound queue holds the read loop back rather than dropping frames
            match self.until_cancelled(self.inbound.push(packet)).await {
                Some(pushed) => pushed?,
                None => return Ok(()),
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let Some(next) = self.until_cancelled(self.inbound.pop()).await else {
                return Ok(());
            };
            let packet = next?;
            self.ctx.metrics.packet_dispatched();

            if !self.ctx.callback.on_message(&self, packet).await {
                debug!("Message hook requested close");
                return Ok(());
            }
        }
    }

    async fn write_loop(self: Arc<Self>, source: WriteSource) -> Result<()> {
        let queue = match source {
            WriteSource::Application => &self.outbound,
            WriteSource::Broker => &self.broker_outbound,
        };

        loop {
            let Some(next) = self.until_cancelled(queue.pop()).await else {
                return Ok(());
            };
            let bytes = next?.serialize();

            match self.until_cancelled(self.write_bytes(&bytes)).await {
                Some(written) => written?,
                None => return Ok(()),
            }
            trace!(?source, bytes = bytes.len(), "Packet written");
            self.ctx.metrics.packet_sent(bytes.len() as u64);
        }
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(ConduitError::ConnectionClosing)?;
        stream.write_all(bytes).await?;
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) -> Result<()> {
        let period = self.ctx.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.until_cancelled(ticker.tick()).await.is_none() {
                return Ok(());
            }
            if self.idle_for() > self.ctx.config.idle_timeout {
                return Err(ConduitError::ConnectionTimeout);
            }
        }
    }
}

impl<T: Packet> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("peer_addr", &self.peer_addr)
            .field("identifier", &self.identifier())
            .field("closed", &self.is_closed())
            .finish()
    }
}
