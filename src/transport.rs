//! Concrete transport backends: TCP, Unix sockets, UDP and WebSocket.
//!
//! Each backend produces [`BackendSession`]s carrying whole frame
//! envelopes:
//!
//! - **TCP / Unix**: a byte stream; the envelope's 4-byte length word
//!   delimits frames. Partial reads are buffered inside the session so
//!   a timed-out `recv` never loses data.
//! - **UDP**: one datagram per envelope. The listener demultiplexes
//!   datagrams per source address into per-peer sessions.
//! - **WebSocket**: one binary message per envelope, via
//!   `tokio-tungstenite`. The dialer honors `http_proxy` /
//!   `HTTP_PROXY` with a CONNECT tunnel and can send one extra header
//!   on the upgrade request; the listener serves a configurable URI
//!   path.
//!
//! TLS configuration references are accepted in the config layer but
//! resolved elsewhere; the sessions here are plaintext pipes.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderName, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::backend::{run_dialer, session_channel, Backend, BackendSession, SessionRef, Shutdown};
use crate::error::{NetError, NetResult};
use crate::frame::MAX_FRAME_SIZE;

/// Read chunk size for stream transports.
const READ_CHUNK: usize = 16 * 1024;

/// Largest datagram the UDP transport will accept. Frames above this
/// must travel over a stream transport.
const MAX_DATAGRAM: usize = 65_507;

/// Queue depth between the UDP listener pump and each per-peer session.
const UDP_SESSION_QUEUE: usize = 64;

// ----------------------------------------------------------------------------
// Length-delimited sessions over byte streams (TCP, Unix)
// ----------------------------------------------------------------------------

/// Incremental frame reader. Partial envelope bytes stay in `buf`
/// across cancelled reads, which is what makes `recv(timeout)` safe.
struct FrameReader<R> {
    io: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(io: R) -> Self {
        FrameReader { io, buf: Vec::new() }
    }

    /// Length of the complete envelope at the front of `buf`, if any.
    fn buffered_envelope(&self) -> NetResult<Option<usize>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let inner = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if inner + 4 > MAX_FRAME_SIZE {
            return Err(NetError::Codec(format!(
                "peer announced a {inner} byte frame, limit is {MAX_FRAME_SIZE}"
            )));
        }
        if self.buf.len() >= inner + 4 {
            Ok(Some(inner + 4))
        } else {
            Ok(None)
        }
    }

    async fn next_frame(&mut self) -> NetResult<Vec<u8>> {
        loop {
            if let Some(total) = self.buffered_envelope()? {
                let rest = self.buf.split_off(total);
                let frame = std::mem::replace(&mut self.buf, rest);
                return Ok(frame);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                return Err(NetError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Session over any split byte stream.
struct StreamSession<R, W> {
    reader: Mutex<FrameReader<R>>,
    writer: Mutex<Option<W>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl<R, W> StreamSession<R, W>
where
    R: AsyncRead + Unpin + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn wrap(read: R, write: W) -> SessionRef {
        let (closed_tx, closed_rx) = watch::channel(false);
        Arc::new(StreamSession {
            reader: Mutex::new(FrameReader::new(read)),
            writer: Mutex::new(Some(write)),
            closed_tx,
            closed_rx,
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|c| *c).await;
    }
}

#[async_trait]
impl<R, W> BackendSession for StreamSession<R, W>
where
    R: AsyncRead + Unpin + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn send(&self, frame: &[u8]) -> NetResult<()> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let mut writer = self.writer.lock().await;
        let Some(io) = writer.as_mut() else {
            return Err(NetError::Closed);
        };
        io.write_all(frame).await?;
        io.flush().await?;
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> NetResult<Vec<u8>> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        tokio::select! {
            _ = self.closed() => Err(NetError::Closed),
            res = async {
                let mut reader = self.reader.lock().await;
                match tokio::time::timeout(timeout, reader.next_frame()).await {
                    Ok(res) => res,
                    Err(_) => Err(NetError::Timeout),
                }
            } => res,
        }
    }

    async fn close(&self) {
        let _ = self.closed_tx.send(true);
        let mut writer = self.writer.lock().await;
        if let Some(mut io) = writer.take() {
            let _ = io.shutdown().await;
        }
    }
}

// ----------------------------------------------------------------------------
// TCP
// ----------------------------------------------------------------------------

/// Accepts TCP connections and emits one session per peer.
pub struct TcpListenerBackend {
    address: String,
}

impl TcpListenerBackend {
    pub fn new(address: impl Into<String>) -> Self {
        TcpListenerBackend { address: address.into() }
    }
}

#[async_trait]
impl Backend for TcpListenerBackend {
    fn label(&self) -> String {
        format!("tcp-listener {}", self.address)
    }

    async fn start(&self, shutdown: Shutdown) -> NetResult<mpsc::Receiver<SessionRef>> {
        let listener = TcpListener::bind(&self.address).await?;
        let local = listener.local_addr()?;
        debug!(addr = %local, "tcp listener started");
        let (tx, rx) = session_channel();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = listener.accept() => res,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        debug!(peer = %peer, "tcp connection accepted");
                        let (read, write) = stream.into_split();
                        if tx.send(StreamSession::wrap(read, write)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Dials one TCP peer, redialing after loss when configured.
pub struct TcpDialerBackend {
    address: String,
    redial: bool,
}

impl TcpDialerBackend {
    pub fn new(address: impl Into<String>, redial: bool) -> Self {
        TcpDialerBackend { address: address.into(), redial }
    }
}

#[async_trait]
impl Backend for TcpDialerBackend {
    fn label(&self) -> String {
        format!("tcp-peer {}", self.address)
    }

    async fn start(&self, shutdown: Shutdown) -> NetResult<mpsc::Receiver<SessionRef>> {
        let (tx, rx) = session_channel();
        let address = self.address.clone();
        let label = self.label();
        let redial = self.redial;
        tokio::spawn(async move {
            run_dialer(label, redial, shutdown, tx, move || {
                let address = address.clone();
                async move {
                    let stream = TcpStream::connect(&address).await?;
                    let _ = stream.set_nodelay(true);
                    let (read, write) = stream.into_split();
                    Ok(StreamSession::wrap(read, write))
                }
            })
            .await;
        });
        Ok(rx)
    }
}

// ----------------------------------------------------------------------------
// Unix sockets
// ----------------------------------------------------------------------------

/// Listens on a Unix socket path, replacing any stale socket file.
#[cfg(unix)]
pub struct UnixListenerBackend {
    path: PathBuf,
}

#[cfg(unix)]
impl UnixListenerBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        UnixListenerBackend { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl Backend for UnixListenerBackend {
    fn label(&self) -> String {
        format!("unix-listener {}", self.path.display())
    }

    async fn start(&self, shutdown: Shutdown) -> NetResult<mpsc::Receiver<SessionRef>> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&self.path)?;
        debug!(path = %self.path.display(), "unix listener started");
        let (tx, rx) = session_channel();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = listener.accept() => res,
                };
                match accepted {
                    Ok((stream, _)) => {
                        let (read, write) = stream.into_split();
                        if tx.send(StreamSession::wrap(read, write)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "unix accept failed");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Dials a Unix socket path.
#[cfg(unix)]
pub struct UnixDialerBackend {
    path: PathBuf,
    redial: bool,
}

#[cfg(unix)]
impl UnixDialerBackend {
    pub fn new(path: impl Into<PathBuf>, redial: bool) -> Self {
        UnixDialerBackend { path: path.into(), redial }
    }
}

#[cfg(unix)]
#[async_trait]
impl Backend for UnixDialerBackend {
    fn label(&self) -> String {
        format!("unix-peer {}", self.path.display())
    }

    async fn start(&self, shutdown: Shutdown) -> NetResult<mpsc::Receiver<SessionRef>> {
        let (tx, rx) = session_channel();
        let path = self.path.clone();
        let label = self.label();
        let redial = self.redial;
        tokio::spawn(async move {
            run_dialer(label, redial, shutdown, tx, move || {
                let path = path.clone();
                async move {
                    let stream = UnixStream::connect(&path).await?;
                    let (read, write) = stream.into_split();
                    Ok(StreamSession::wrap(read, write))
                }
            })
            .await;
        });
        Ok(rx)
    }
}

// ----------------------------------------------------------------------------
// UDP
// ----------------------------------------------------------------------------

type UdpPeerMap = Arc<StdMutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// One peer's view of a shared listening socket.
struct UdpPeerSession {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    peers: UdpPeerMap,
    closed: AtomicBool,
}

#[async_trait]
impl BackendSession for UdpPeerSession {
    async fn send(&self, frame: &[u8]) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        self.socket.send_to(frame, self.peer).await?;
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> NetResult<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(NetError::Closed),
            Err(_) => Err(NetError::Timeout),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.peers.lock().expect("udp peer map").remove(&self.peer);
    }
}

/// UDP listener: demultiplexes datagrams per source address into
/// per-peer sessions over one shared socket.
pub struct UdpListenerBackend {
    address: String,
}

impl UdpListenerBackend {
    pub fn new(address: impl Into<String>) -> Self {
        UdpListenerBackend { address: address.into() }
    }
}

#[async_trait]
impl Backend for UdpListenerBackend {
    fn label(&self) -> String {
        format!("udp-listener {}", self.address)
    }

    async fn start(&self, shutdown: Shutdown) -> NetResult<mpsc::Receiver<SessionRef>> {
        let socket = Arc::new(UdpSocket::bind(&self.address).await?);
        debug!(addr = %socket.local_addr()?, "udp listener started");
        let (tx, rx) = session_channel();
        let peers: UdpPeerMap = Arc::new(StdMutex::new(HashMap::new()));
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = socket.recv_from(&mut buf) => res,
                };
                let (len, from) = match received {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(error = %e, "udp recv failed");
                        break;
                    }
                };
                let datagram = buf[..len].to_vec();
                let existing = peers.lock().expect("udp peer map").get(&from).cloned();
                match existing {
                    Some(queue) => {
                        // Per-peer queue full means the link is stalled;
                        // dropping a datagram here is no worse than the
                        // network doing it.
                        let _ = queue.try_send(datagram);
                    }
                    None => {
                        let (peer_tx, peer_rx) = mpsc::channel(UDP_SESSION_QUEUE);
                        let _ = peer_tx.try_send(datagram);
                        peers
                            .lock()
                            .expect("udp peer map")
                            .insert(from, peer_tx);
                        let session: SessionRef = Arc::new(UdpPeerSession {
                            socket: socket.clone(),
                            peer: from,
                            inbound: Mutex::new(peer_rx),
                            peers: peers.clone(),
                            closed: AtomicBool::new(false),
                        });
                        debug!(peer = %from, "udp peer session created");
                        if tx.send(session).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Connected UDP socket toward one peer.
struct UdpDialSession {
    socket: UdpSocket,
    closed: AtomicBool,
}

#[async_trait]
impl BackendSession for UdpDialSession {
    async fn send(&self, frame: &[u8]) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        self.socket.send(frame).await?;
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> NetResult<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(buf)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(NetError::Timeout),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Dials one UDP peer.
pub struct UdpDialerBackend {
    address: String,
    redial: bool,
}

impl UdpDialerBackend {
    pub fn new(address: impl Into<String>, redial: bool) -> Self {
        UdpDialerBackend { address: address.into(), redial }
    }
}

#[async_trait]
impl Backend for UdpDialerBackend {
    fn label(&self) -> String {
        format!("udp-peer {}", self.address)
    }

    async fn start(&self, shutdown: Shutdown) -> NetResult<mpsc::Receiver<SessionRef>> {
        let (tx, rx) = session_channel();
        let address = self.address.clone();
        let label = self.label();
        let redial = self.redial;
        tokio::spawn(async move {
            run_dialer(label, redial, shutdown, tx, move || {
                let address = address.clone();
                async move {
                    let socket = UdpSocket::bind("0.0.0.0:0").await?;
                    socket.connect(&address).await?;
                    Ok(Arc::new(UdpDialSession {
                        socket,
                        closed: AtomicBool::new(false),
                    }) as SessionRef)
                }
            })
            .await;
        });
        Ok(rx)
    }
}

// ----------------------------------------------------------------------------
// WebSocket
// ----------------------------------------------------------------------------

/// Session over an established WebSocket; one binary message per frame.
struct WsSession<S> {
    reader: Mutex<futures::stream::SplitStream<WebSocketStream<S>>>,
    writer: Mutex<futures::stream::SplitSink<WebSocketStream<S>, Message>>,
    closed: AtomicBool,
}

impl<S> WsSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn wrap(ws: WebSocketStream<S>) -> SessionRef {
        let (writer, reader) = ws.split();
        Arc::new(WsSession {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl<S> BackendSession for WsSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn send(&self, frame: &[u8]) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(ws_error)
    }

    async fn recv(&self, timeout: Duration) -> NetResult<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let mut reader = self.reader.lock().await;
        loop {
            let next = match tokio::time::timeout(timeout, reader.next()).await {
                Ok(next) => next,
                Err(_) => return Err(NetError::Timeout),
            };
            match next {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                // Control messages are the websocket layer's business.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    return Err(NetError::Codec("unexpected text message".into()))
                }
                Some(Ok(Message::Close(_))) | None => return Err(NetError::Closed),
                Some(Err(e)) => return Err(ws_error(e)),
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        let _ = writer.close().await;
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> NetError {
    use tokio_tungstenite::tungstenite::Error as E;
    match e {
        E::ConnectionClosed | E::AlreadyClosed => NetError::Closed,
        E::Io(io) => NetError::Transport(io),
        other => NetError::Transport(io::Error::new(io::ErrorKind::Other, other)),
    }
}

/// HTTP server accepting WebSocket upgrades on one URI path.
pub struct WsListenerBackend {
    address: String,
    path: String,
}

impl WsListenerBackend {
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        WsListenerBackend {
            address: address.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl Backend for WsListenerBackend {
    fn label(&self) -> String {
        format!("ws-listener {}{}", self.address, self.path)
    }

    async fn start(&self, shutdown: Shutdown) -> NetResult<mpsc::Receiver<SessionRef>> {
        let listener = TcpListener::bind(&self.address).await?;
        debug!(addr = %listener.local_addr()?, path = %self.path, "websocket listener started");
        let (tx, rx) = session_channel();
        let expected_path = self.path.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = listener.accept() => res,
                };
                let (stream, peer) = match accepted {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(error = %e, "websocket accept failed");
                        break;
                    }
                };
                let tx = tx.clone();
                let expected_path = expected_path.clone();
                tokio::spawn(async move {
                    let check = |req: &Request, resp: Response| {
                        if req.uri().path() == expected_path {
                            Ok(resp)
                        } else {
                            let mut reject = ErrorResponse::new(Some("not found".into()));
                            *reject.status_mut() = StatusCode::NOT_FOUND;
                            Err(reject)
                        }
                    };
                    match tokio_tungstenite::accept_hdr_async(stream, check).await {
                        Ok(ws) => {
                            debug!(peer = %peer, "websocket connection accepted");
                            let _ = tx.send(WsSession::wrap(ws)).await;
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "websocket upgrade failed");
                        }
                    }
                });
            }
        });
        Ok(rx)
    }
}

/// Dials a `ws://` URL, optionally through an HTTP CONNECT proxy taken
/// from the environment.
pub struct WsDialerBackend {
    url: String,
    extra_header: Option<(String, String)>,
    redial: bool,
}

impl WsDialerBackend {
    pub fn new(
        url: impl Into<String>,
        extra_header: Option<(String, String)>,
        redial: bool,
    ) -> Self {
        WsDialerBackend {
            url: url.into(),
            extra_header,
            redial,
        }
    }
}

#[async_trait]
impl Backend for WsDialerBackend {
    fn label(&self) -> String {
        format!("ws-peer {}", self.url)
    }

    async fn start(&self, shutdown: Shutdown) -> NetResult<mpsc::Receiver<SessionRef>> {
        let (tx, rx) = session_channel();
        let url = self.url.clone();
        let extra = self.extra_header.clone();
        let label = self.label();
        let redial = self.redial;
        tokio::spawn(async move {
            run_dialer(label, redial, shutdown, tx, move || {
                let url = url.clone();
                let extra = extra.clone();
                async move { dial_websocket(&url, &extra).await }
            })
            .await;
        });
        Ok(rx)
    }
}

async fn dial_websocket(
    url: &str,
    extra_header: &Option<(String, String)>,
) -> NetResult<SessionRef> {
    let mut request = url
        .into_client_request()
        .map_err(|e| NetError::Config(format!("invalid websocket URL {url:?}: {e}")))?;
    if let Some((name, value)) = extra_header {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| NetError::Config(format!("invalid extra header name: {e}")))?;
        let value = value
            .parse()
            .map_err(|_| NetError::Config("invalid extra header value".into()))?;
        request.headers_mut().insert(name, value);
    }

    let host = request
        .uri()
        .host()
        .ok_or_else(|| NetError::Config(format!("websocket URL {url:?} has no host")))?
        .to_string();
    let port = request.uri().port_u16().unwrap_or(80);

    let stream = match http_proxy_from_env() {
        Some(proxy) => connect_via_proxy(&proxy, &host, port).await?,
        None => TcpStream::connect((host.as_str(), port)).await?,
    };
    let _ = stream.set_nodelay(true);
    let (ws, _resp) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(ws_error)?;
    Ok(WsSession::wrap(ws))
}

fn http_proxy_from_env() -> Option<String> {
    for key in ["http_proxy", "HTTP_PROXY", "all_proxy", "ALL_PROXY"] {
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Establish a CONNECT tunnel through an HTTP proxy.
async fn connect_via_proxy(proxy: &str, host: &str, port: u16) -> NetResult<TcpStream> {
    let proxy_addr = proxy
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string();
    let mut stream = TcpStream::connect(&proxy_addr).await?;
    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;

    // Read until the end of the proxy's response headers.
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err(NetError::Transport(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized proxy response",
            )));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(NetError::Closed);
        }
        response.push(byte[0]);
    }
    let status = String::from_utf8_lossy(&response);
    let ok = status
        .lines()
        .next()
        .is_some_and(|line| line.contains(" 200 ") || line.ends_with(" 200"));
    if !ok {
        return Err(NetError::Transport(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy refused CONNECT: {}", status.lines().next().unwrap_or("")),
        )));
    }
    Ok(stream)
}
