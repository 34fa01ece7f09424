//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use tcp_conduit::config::ServerConfig;
use tcp_conduit::registry::{ConnectionHub, Publisher, Registry};
use tcp_conduit::{Callback, Connection, Frame, FrameCodec, FrameProtocol, Server};

pub type Client = Framed<TcpStream, FrameCodec>;

/// Callback recording every hook invocation.
///
/// Message conventions: `bye` ends the connection, `panic` panics inside the
/// hook, `bind:<id>` binds an identifier, `pub:<data>` publishes to topic `up`.
/// Everything else is echoed when `echo` is set.
pub struct Recorder {
    pub admit: bool,
    pub echo: bool,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub messages: Mutex<Vec<Vec<u8>>>,
    pub conns: Mutex<Vec<Arc<Connection<Frame>>>>,
    pub closed_indices: Mutex<Vec<u32>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with(true, true))
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(Self::with(true, false))
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self::with(false, false))
    }

    fn with(admit: bool, echo: bool) -> Self {
        Self {
            admit,
            echo,
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
            conns: Mutex::new(Vec::new()),
            closed_indices: Mutex::new(Vec::new()),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().unwrap().clone()
    }

    pub fn conn(&self, i: usize) -> Arc<Connection<Frame>> {
        self.conns.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl Callback<Frame> for Recorder {
    async fn on_connect(&self, conn: &Arc<Connection<Frame>>) -> bool {
        conn.put_extra_data(conn.peer_addr());
        self.conns.lock().unwrap().push(Arc::clone(conn));
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.admit
    }

    async fn on_message(&self, conn: &Arc<Connection<Frame>>, frame: Frame) -> bool {
        conn.touch();
        self.messages.lock().unwrap().push(frame.payload.clone());

        if frame.payload == b"bye" {
            return false;
        }
        if frame.payload == b"panic" {
            panic!("message hook failure");
        }
        if let Some(id) = frame.payload.strip_prefix(b"bind:") {
            return conn
                .bind_identifier(String::from_utf8_lossy(id).into_owned())
                .is_ok();
        }
        if let Some(data) = frame.payload.strip_prefix(b"pub:") {
            return conn.publish("up", data.to_vec()).is_ok();
        }
        if self.echo {
            return conn.write_async(frame, Duration::from_secs(1)).await.is_ok();
        }
        true
    }

    fn on_close(&self, conn: &Connection<Frame>) {
        self.closed_indices.lock().unwrap().push(conn.index());
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Registry counting calls on top of the in-memory hub.
pub struct CountingRegistry {
    pub hub: ConnectionHub<Frame>,
    pub registers: AtomicUsize,
    pub deregisters: AtomicUsize,
}

impl CountingRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_publisher(Arc::new(tcp_conduit::registry::DiscardPublisher))
    }

    pub fn with_publisher(publisher: Arc<dyn Publisher>) -> Arc<Self> {
        Arc::new(Self {
            hub: ConnectionHub::new(publisher),
            registers: AtomicUsize::new(0),
            deregisters: AtomicUsize::new(0),
        })
    }

    pub fn deregisters(&self) -> usize {
        self.deregisters.load(Ordering::SeqCst)
    }
}

impl Registry<Frame> for CountingRegistry {
    fn register(&self, index: u32, conn: Arc<Connection<Frame>>) {
        self.registers.fetch_add(1, Ordering::SeqCst);
        self.hub.register(index, conn);
    }

    fn bind(&self, identifier: &str, index: u32) {
        self.hub.bind(identifier, index);
    }

    fn deregister(&self, index: u32, identifier: Option<&str>) {
        self.deregisters.fetch_add(1, Ordering::SeqCst);
        self.hub.deregister(index, identifier);
    }

    fn lookup(&self, identifier: &str) -> Option<Arc<Connection<Frame>>> {
        self.hub.lookup(identifier)
    }

    fn exists(&self, identifier: &str) -> bool {
        self.hub.exists(identifier)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> tcp_conduit::Result<()> {
        self.hub.publish(topic, payload)
    }
}

pub struct TestServer {
    pub server: Arc<Server<Frame>>,
    pub addr: SocketAddr,
    pub accept: JoinHandle<()>,
}

pub async fn spawn_server(
    config: ServerConfig,
    callback: Arc<Recorder>,
    registry: Arc<CountingRegistry>,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::<Frame>::new(
        config,
        Arc::new(FrameProtocol),
        callback,
        registry,
    ));

    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start(listener, Duration::from_millis(50)).await })
    };

    TestServer {
        server,
        addr,
        accept,
    }
}

pub async fn connect(addr: SocketAddr) -> Client {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, FrameCodec)
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
