//! One TLS connection to one DoT server.
//!
//! A [`TlsSocket`] is a handle to a detached I/O task. The task connects,
//! handshakes and then shuttles length-prefixed DNS messages; the handle
//! enqueues outbound queries over a channel and the task reports responses
//! and the final close through a [`SocketEvent`] channel the transport owns.
//! The task holds no reference back to the transport.
//!
//! Shutdown is a hard property: dropping the handle wakes the task out of
//! whatever it is blocked on, including a hung handshake, and the task emits
//! exactly one `Closed` event on its way out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::session_cache::DnsTlsSessionCache;
use crate::server::DnsServer;
use crate::tls;

/// Ceiling on TCP connect plus TLS handshake before the attempt is treated
/// as a network failure.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a socket reports to its transport.
#[derive(Debug)]
pub enum SocketEvent {
    /// One complete DNS message, length prefix stripped.
    Response(Vec<u8>),
    /// The connection is gone. Emitted exactly once per socket.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Init,
    Initialized,
    Started,
}

pub struct TlsSocket {
    state: HandleState,
    server: DnsServer,
    mark: u32,
    insecure_test_override: bool,
    session_cache: Arc<DnsTlsSessionCache>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    server_name: Option<ServerName<'static>>,
    cmd_tx: mpsc::UnboundedSender<Vec<u8>>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    shutdown: Arc<Notify>,
    ready_rx: Option<oneshot::Receiver<bool>>,
}

impl TlsSocket {
    pub fn new(
        server: DnsServer,
        mark: u32,
        event_tx: mpsc::UnboundedSender<SocketEvent>,
        session_cache: Arc<DnsTlsSessionCache>,
        insecure_test_override: bool,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        TlsSocket {
            state: HandleState::Init,
            server,
            mark,
            insecure_test_override,
            session_cache,
            tls_config: None,
            server_name: None,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            event_tx,
            shutdown: Arc::new(Notify::new()),
            ready_rx: None,
        }
    }

    /// Prepares the TLS context. One-shot: a second call returns false.
    pub fn initialize(&mut self) -> bool {
        if self.state != HandleState::Init {
            return false;
        }
        let name = match tls::server_name(&self.server) {
            Ok(name) => name,
            Err(e) => {
                debug!("cannot initialize socket for {}: {}", self.server, e);
                return false;
            }
        };
        self.server_name = Some(name);
        self.tls_config = Some(Arc::new(tls::create_dot_client_config(
            &self.server,
            self.session_cache.clone(),
            self.insecure_test_override,
        )));
        self.state = HandleState::Initialized;
        true
    }

    /// Schedules the connect and TLS handshake on the I/O task and returns
    /// immediately. One-shot, and only valid after [`initialize`].
    ///
    /// [`initialize`]: TlsSocket::initialize
    pub fn start_handshake(&mut self) -> bool {
        if self.state != HandleState::Initialized {
            return false;
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        self.ready_rx = Some(ready_rx);
        self.state = HandleState::Started;
        tokio::spawn(run_io(
            self.server.addr,
            self.server_name.take().unwrap(),
            self.tls_config.take().unwrap(),
            self.mark,
            self.cmd_rx.take().unwrap(),
            self.event_tx.clone(),
            self.shutdown.clone(),
            ready_tx,
        ));
        true
    }

    /// Waits for the scheduled handshake. False when the connection could
    /// not be established.
    pub async fn handshake_complete(&mut self) -> bool {
        match self.ready_rx.take() {
            Some(rx) => rx.await.unwrap_or(false),
            None => false,
        }
    }

    /// Enqueues a wire query (`body` excludes the transaction id, which is
    /// prepended here together with the 2-byte length framing). False only
    /// when the socket is already closed.
    pub fn query(&self, id: u16, body: &[u8]) -> bool {
        if self.state != HandleState::Started {
            return false;
        }
        let Some(len) = body.len().checked_add(2).and_then(|l| u16::try_from(l).ok()) else {
            return false;
        };
        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(body);
        self.cmd_tx.send(frame).is_ok()
    }
}

impl Drop for TlsSocket {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

async fn connect_tcp(addr: SocketAddr, mark: u32) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if mark != 0 {
        use std::os::fd::AsRawFd;
        let fd = socket.as_raw_fd();
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            log::warn!(
                "failed to set mark {} on socket: {}",
                mark,
                std::io::Error::last_os_error()
            );
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = mark;

    socket.connect(addr).await
}

#[allow(clippy::too_many_arguments)]
async fn run_io(
    addr: SocketAddr,
    server_name: ServerName<'static>,
    config: Arc<rustls::ClientConfig>,
    mark: u32,
    mut cmd_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    shutdown: Arc<Notify>,
    ready_tx: oneshot::Sender<bool>,
) {
    let connect = tokio::time::timeout(CONNECT_TIMEOUT, async {
        let tcp = connect_tcp(addr, mark).await?;
        tcp.set_nodelay(true).ok();
        TlsConnector::from(config).connect(server_name, tcp).await
    });

    let stream = tokio::select! {
        biased;
        _ = shutdown.notified() => {
            debug!("socket to {} shut down during handshake", addr);
            let _ = ready_tx.send(false);
            let _ = event_tx.send(SocketEvent::Closed);
            return;
        }
        result = connect => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("connection to {} failed: {}", addr, e);
                let _ = ready_tx.send(false);
                let _ = event_tx.send(SocketEvent::Closed);
                return;
            }
            Err(_) => {
                debug!("connection to {} timed out", addr);
                let _ = ready_tx.send(false);
                let _ = event_tx.send(SocketEvent::Closed);
                return;
            }
        }
    };
    let _ = ready_tx.send(true);

    let (rd, mut wr) = tokio::io::split(stream);
    let mut reader = tokio::spawn(read_loop(rd, event_tx.clone()));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = &mut reader => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(frame) => {
                    if wr.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    reader.abort();
    debug!("socket to {} closed", addr);
    let _ = event_tx.send(SocketEvent::Closed);
}

async fn read_loop(
    mut rd: ReadHalf<TlsStream<TcpStream>>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
) {
    loop {
        let mut len_buf = [0u8; 2];
        if rd.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        if rd.read_exact(&mut body).await.is_err() {
            return;
        }
        if event_tx.send(SocketEvent::Response(body)).is_err() {
            return;
        }
    }
}

/// Scripted stand-ins for a DoT server, mirroring the failure modes seen in
/// production: well-behaved echo servers, servers that batch or reorder
/// responses, servers that silently drop queries and hang up, and servers
/// that emit garbage.
#[cfg(test)]
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Respond immediately, echoing the query body.
    Echo,
    /// Respond with the observed wire id as the body, exposing which id the
    /// query map assigned.
    EchoId,
    /// Hold responses until `hold` queries have arrived, then flush them,
    /// optionally in reverse order.
    Delay { hold: usize, reverse: bool },
    /// Answer at most `limit` queries per connection (and only those no
    /// larger than `max_size`), then close.
    Limited { limit: usize, max_size: usize },
    /// Echo each query twice and add an unsolicited response with id+1.
    Garbage,
    /// Connect fine, then close before answering anything.
    CloseImmediately,
    /// Fail the handshake outright.
    FailHandshake,
}

#[cfg(test)]
pub struct FakeSocket {
    behavior: FakeBehavior,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    state: std::sync::Mutex<FakeState>,
}

#[cfg(test)]
#[derive(Default)]
struct FakeState {
    queries_seen: usize,
    ids_outstanding: std::collections::HashSet<u16>,
    held: Vec<Vec<u8>>,
}

#[cfg(test)]
impl FakeSocket {
    fn new(behavior: FakeBehavior, event_tx: mpsc::UnboundedSender<SocketEvent>) -> Self {
        FakeSocket {
            behavior,
            event_tx,
            state: std::sync::Mutex::new(FakeState::default()),
        }
    }

    fn echo(id: u16, body: &[u8]) -> Vec<u8> {
        let mut response = Vec::with_capacity(body.len() + 2);
        response.extend_from_slice(&id.to_be_bytes());
        response.extend_from_slice(body);
        response
    }

    pub fn start_handshake(&self) -> bool {
        match self.behavior {
            FakeBehavior::FailHandshake => false,
            FakeBehavior::CloseImmediately => {
                let _ = self.event_tx.send(SocketEvent::Closed);
                true
            }
            _ => true,
        }
    }

    pub fn query(&self, id: u16, body: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        state.queries_seen += 1;
        match &self.behavior {
            FakeBehavior::Echo => {
                let _ = self.event_tx.send(SocketEvent::Response(Self::echo(id, body)));
                true
            }
            FakeBehavior::EchoId => {
                let mut response = Vec::with_capacity(4);
                response.extend_from_slice(&id.to_be_bytes());
                response.extend_from_slice(&id.to_be_bytes());
                let _ = self.event_tx.send(SocketEvent::Response(response));
                true
            }
            FakeBehavior::Delay { hold, reverse } => {
                // In-flight ids must be connection-unique.
                assert!(
                    state.ids_outstanding.insert(id),
                    "duplicate in-flight id {}",
                    id
                );
                let response = Self::echo(id, body);
                state.held.push(response);
                if state.held.len() == *hold {
                    if *reverse {
                        state.held.reverse();
                    }
                    for response in state.held.drain(..) {
                        let _ = self.event_tx.send(SocketEvent::Response(response));
                    }
                    state.ids_outstanding.clear();
                }
                true
            }
            FakeBehavior::Limited { limit, max_size } => {
                if state.queries_seen <= *limit && body.len() <= *max_size {
                    let _ = self.event_tx.send(SocketEvent::Response(Self::echo(id, body)));
                }
                if state.queries_seen == *limit {
                    let _ = self.event_tx.send(SocketEvent::Closed);
                }
                state.queries_seen <= *limit
            }
            FakeBehavior::Garbage => {
                let echo = Self::echo(id, body);
                let _ = self.event_tx.send(SocketEvent::Response(echo.clone()));
                let _ = self.event_tx.send(SocketEvent::Response(echo));
                let _ = self
                    .event_tx
                    .send(SocketEvent::Response(Self::echo(id.wrapping_add(1), body)));
                true
            }
            FakeBehavior::CloseImmediately => true,
            FakeBehavior::FailHandshake => false,
        }
    }
}

/// Creates sockets for transports: real TLS sockets in production, scripted
/// fakes under test.
#[derive(Clone, Default)]
pub struct SocketFactory {
    /// Accept self-signed certificates. Only settable by test frontends.
    pub insecure_test_override: bool,
    #[cfg(test)]
    pub(crate) fake: Option<FakeSpec>,
}

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct FakeSpec {
    pub behavior: FakeBehavior,
    /// Simulate failure to even create a connection.
    pub fail_create: bool,
    /// Every (mark, server) the factory was asked for, for assertions.
    pub created: Arc<std::sync::Mutex<Vec<(u32, DnsServer)>>>,
}

#[cfg(test)]
impl FakeSpec {
    pub fn new(behavior: FakeBehavior) -> Self {
        FakeSpec {
            behavior,
            fail_create: false,
            created: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

#[cfg(test)]
impl SocketFactory {
    pub(crate) fn faked(spec: FakeSpec) -> Self {
        SocketFactory {
            insecure_test_override: false,
            fake: Some(spec),
        }
    }
}

impl SocketFactory {
    pub fn new() -> Self {
        SocketFactory::default()
    }

    pub(crate) fn create(
        &self,
        server: &DnsServer,
        mark: u32,
        event_tx: mpsc::UnboundedSender<SocketEvent>,
        session_cache: &Arc<DnsTlsSessionCache>,
    ) -> Option<SocketVariant> {
        #[cfg(test)]
        if let Some(spec) = &self.fake {
            spec.created.lock().unwrap().push((mark, server.clone()));
            if spec.fail_create {
                return None;
            }
            return Some(SocketVariant::Fake(FakeSocket::new(
                spec.behavior.clone(),
                event_tx.clone(),
            )));
        }
        Some(SocketVariant::Tls(TlsSocket::new(
            server.clone(),
            mark,
            event_tx,
            session_cache.clone(),
            self.insecure_test_override,
        )))
    }
}

/// The socket a transport drives: a real TLS connection, or a scripted fake
/// in tests.
pub enum SocketVariant {
    Tls(TlsSocket),
    #[cfg(test)]
    Fake(FakeSocket),
}

impl SocketVariant {
    /// Brings the connection up. False means no connection could be
    /// established and no query was ever transmitted.
    pub async fn connect(&mut self) -> bool {
        match self {
            SocketVariant::Tls(socket) => {
                if !socket.initialize() {
                    return false;
                }
                if !socket.start_handshake() {
                    return false;
                }
                socket.handshake_complete().await
            }
            #[cfg(test)]
            SocketVariant::Fake(socket) => socket.start_handshake(),
        }
    }

    pub fn query(&self, id: u16, body: &[u8]) -> bool {
        match self {
            SocketVariant::Tls(socket) => socket.query(id, body),
            #[cfg(test)]
            SocketVariant::Fake(socket) => socket.query(id, body),
        }
    }
}
