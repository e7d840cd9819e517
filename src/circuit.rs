//! User circuits: datagram endpoints and reliable streams.
//!
//! The overlay delivers individual data frames with no ordering or
//! delivery guarantee. This module builds the two user-facing shapes on
//! top of that:
//!
//! - [`PacketConn`]: a bound service receiving raw datagrams, with
//!   `send_to` / `recv(timeout)` semantics.
//! - [`Stream`]: a reliable, ordered, bidirectional byte stream between
//!   a local endpoint and a remote service, with its own sequencing,
//!   retransmission and flow control.
//!
//! ## Stream protocol
//!
//! Stream chunks ride inside data-frame payloads. Every chunk carries a
//! 64-bit session id, a sequence number (one per chunk, not per byte),
//! flag bits (SYN, FIN, ACK, RST) and a cumulative `ack` naming the
//! next sequence the sender of the chunk expects.
//!
//! Connection setup: the dialer binds a fresh internal endpoint and
//! sends SYN (seq 0) to the advertised service. The acceptor binds its
//! own internal endpoint and answers SYN|ACK (its seq 0) *from* that
//! endpoint, which is how the dialer learns the per-stream address.
//! Everything after flows between the two internal endpoints, so
//! concurrent streams to one advertised service never interleave.
//!
//! Reliability: the sender keeps every unacknowledged chunk, limited to
//! [`STREAM_WINDOW`] payload bytes in flight, retransmitting the oldest
//! on a timer; the receiver suppresses duplicates, reassembles in
//! order and acks on every arrival. FIN consumes a sequence number and
//! closes one direction; RST aborts the stream immediately.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bincode::Options;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{NetError, NetResult};
use crate::frame::{DataFrame, DEFAULT_TTL, MAX_FRAME_SIZE};
use crate::identity::{NodeId, INTERNAL_PREFIX};
use crate::routing::EngineHandle;
use crate::services::{Delivery, ServiceRegistry, UnreachableNotice};

/// Max unacknowledged payload bytes in flight per stream.
pub const STREAM_WINDOW: usize = 256 * 1024;

/// Max payload bytes per stream chunk.
pub const STREAM_MTU: usize = 16 * 1024;

/// Oldest-chunk retransmission timeout.
const RETRANSMIT_AFTER: Duration = Duration::from_millis(300);

/// Actor housekeeping cadence (retransmission scan).
const TICK: Duration = Duration::from_millis(100);

/// Retransmissions of one chunk before the stream is declared dead.
const MAX_RETRANSMITS: u32 = 20;

/// Default deadline for `dial`.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for the FIN handshake before falling back to RST.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const FLAG_SYN: u8 = 0b0001;
const FLAG_FIN: u8 = 0b0010;
const FLAG_ACK: u8 = 0b0100;
const FLAG_RST: u8 = 0b1000;

/// One stream chunk, carried as a data-frame payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Chunk {
    session: u64,
    seq: u64,
    flags: u8,
    /// Next sequence number the sender of this chunk expects.
    ack: u64,
    payload: Vec<u8>,
}

impl Chunk {
    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Pure acknowledgment: consumes no sequence number.
    fn is_pure_ack(&self) -> bool {
        self.has(FLAG_ACK) && self.payload.is_empty() && self.flags & (FLAG_SYN | FLAG_FIN | FLAG_RST) == 0
    }
}

fn chunk_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
        .with_big_endian()
}

fn encode_chunk(chunk: &Chunk) -> Vec<u8> {
    chunk_options()
        .serialize(chunk)
        .expect("chunk under the frame limit always encodes")
}

fn decode_chunk(bytes: &[u8]) -> NetResult<Chunk> {
    Ok(chunk_options().deserialize(bytes)?)
}

/// Allocate an internal per-stream endpoint name.
fn ephemeral_service() -> String {
    format!("{}s{:08x}", INTERNAL_PREFIX, rand::thread_rng().gen::<u32>())
}

// ----------------------------------------------------------------------------
// Datagram endpoint
// ----------------------------------------------------------------------------

/// One datagram received on a [`PacketConn`].
#[derive(Debug)]
pub struct Datagram {
    pub from_node: NodeId,
    pub from_service: String,
    pub payload: Vec<u8>,
}

/// A bound service endpoint with datagram semantics.
///
/// Created through the node facade. Holds a lookup-only handle to the
/// routing engine; closing (or dropping) releases the binding and
/// withdraws the advert if one was published.
pub struct PacketConn {
    engine: EngineHandle,
    registry: Arc<ServiceRegistry>,
    local_node: NodeId,
    service: String,
    advertised: bool,
    rx: Mutex<mpsc::Receiver<Delivery>>,
    closed: AtomicBool,
}

impl PacketConn {
    pub(crate) fn new(
        engine: EngineHandle,
        registry: Arc<ServiceRegistry>,
        local_node: NodeId,
        service: String,
        advertised: bool,
        rx: mpsc::Receiver<Delivery>,
    ) -> Self {
        PacketConn {
            engine,
            registry,
            local_node,
            service,
            advertised,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_service(&self) -> &str {
        &self.service
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// Send one datagram. Fails fast with `Unreachable` when the
    /// routing table has no entry for the destination.
    pub async fn send_to(
        &self,
        node: &NodeId,
        service: &str,
        payload: Vec<u8>,
    ) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        if *node != self.local_node && self.engine.snapshot().route_to(node).is_none() {
            return Err(NetError::Unreachable(node.clone()));
        }
        self.engine
            .send_data(DataFrame {
                src_node: self.local_node.clone(),
                dst_node: node.clone(),
                src_service: self.service.clone(),
                dst_service: service.to_string(),
                ttl: DEFAULT_TTL,
                payload,
            })
            .await;
        Ok(())
    }

    /// Receive the next datagram. Unreachable notices for traffic this
    /// endpoint originated surface as errors here.
    pub async fn recv(&self, timeout: Duration) -> NetResult<Datagram> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(Delivery::Data(frame))) => Ok(Datagram {
                from_node: frame.src_node,
                from_service: frame.src_service,
                payload: frame.payload,
            }),
            Ok(Some(Delivery::Unreachable(notice))) => Err(notice_to_error(notice)),
            Ok(None) => Err(NetError::Closed),
            Err(_) => Err(NetError::Timeout),
        }
    }

    /// Release the binding; idempotent. Pending receivers drain with
    /// `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.unbind(&self.service);
        if self.advertised {
            self.engine.try_withdraw(&self.service);
        }
    }
}

impl Drop for PacketConn {
    fn drop(&mut self) {
        self.close();
    }
}

fn notice_to_error(notice: UnreachableNotice) -> NetError {
    if notice.reason.contains("no such service") {
        NetError::NoSuchService {
            node: notice.problem_node,
            service: notice.problem_service,
        }
    } else {
        NetError::Unreachable(notice.problem_node)
    }
}

// ----------------------------------------------------------------------------
// Reliable stream: sender and receiver state machines
// ----------------------------------------------------------------------------

struct Pending {
    seq: u64,
    flags: u8,
    payload: Vec<u8>,
    sent_at: Instant,
    retransmits: u32,
}

/// Sender half: sequencing, the in-flight window and retransmission.
struct SendWindow {
    next_seq: u64,
    unacked: VecDeque<Pending>,
    inflight_bytes: usize,
}

impl SendWindow {
    fn new(next_seq: u64) -> Self {
        SendWindow {
            next_seq,
            unacked: VecDeque::new(),
            inflight_bytes: 0,
        }
    }

    fn fits(&self, payload_len: usize) -> bool {
        self.inflight_bytes + payload_len <= STREAM_WINDOW
    }

    /// Assign the next sequence and start tracking the chunk.
    fn stage(&mut self, flags: u8, payload: Vec<u8>) -> (u64, u8, Vec<u8>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.inflight_bytes += payload.len();
        self.unacked.push_back(Pending {
            seq,
            flags,
            payload: payload.clone(),
            sent_at: Instant::now(),
            retransmits: 0,
        });
        (seq, flags, payload)
    }

    /// Apply a cumulative ack. Returns true if anything was retired.
    fn apply_ack(&mut self, ack: u64) -> bool {
        let mut retired = false;
        while self
            .unacked
            .front()
            .is_some_and(|pending| pending.seq < ack)
        {
            let pending = self.unacked.pop_front().expect("front checked");
            self.inflight_bytes -= pending.payload.len();
            retired = true;
        }
        retired
    }

    /// Oldest chunk due for retransmission, if any. Bumps its counters.
    fn due_for_retransmit(&mut self) -> NetResult<Option<(u64, u8, Vec<u8>)>> {
        let Some(front) = self.unacked.front_mut() else {
            return Ok(None);
        };
        if front.sent_at.elapsed() < RETRANSMIT_AFTER {
            return Ok(None);
        }
        if front.retransmits >= MAX_RETRANSMITS {
            return Err(NetError::Timeout);
        }
        front.retransmits += 1;
        front.sent_at = Instant::now();
        Ok(Some((front.seq, front.flags, front.payload.clone())))
    }

    fn all_acked(&self) -> bool {
        self.unacked.is_empty()
    }
}

/// Receiver half: duplicate suppression and in-order reassembly.
struct Reassembler {
    /// Next sequence to deliver; doubles as the cumulative ack we send.
    recv_next: u64,
    pending: BTreeMap<u64, (u8, Vec<u8>)>,
}

impl Reassembler {
    fn new(recv_next: u64) -> Self {
        Reassembler {
            recv_next,
            pending: BTreeMap::new(),
        }
    }

    /// Offer one chunk; returns the newly deliverable run, in order.
    /// Duplicates (already delivered or already pending) are dropped.
    fn offer(&mut self, seq: u64, flags: u8, payload: Vec<u8>) -> Vec<(u8, Vec<u8>)> {
        if seq < self.recv_next {
            return Vec::new();
        }
        self.pending.entry(seq).or_insert((flags, payload));
        let mut ready = Vec::new();
        while let Some(entry) = self.pending.remove(&self.recv_next) {
            self.recv_next += 1;
            ready.push(entry);
        }
        ready
    }

    fn ack(&self) -> u64 {
        self.recv_next
    }
}

// ----------------------------------------------------------------------------
// Stream handle and actor
// ----------------------------------------------------------------------------

enum StreamCtl {
    Close,
    Abort,
}

/// Reliable, ordered, bidirectional byte stream over the mesh.
///
/// Clone-able; all clones talk to the same per-stream task. `recv`
/// yields payload runs in order; after the peer finishes its side it
/// returns `Closed`. Dropping every clone closes the stream gracefully.
#[derive(Clone, Debug)]
pub struct Stream {
    peer_node: NodeId,
    out_tx: mpsc::Sender<Vec<u8>>,
    in_rx: Arc<Mutex<mpsc::Receiver<NetResult<Vec<u8>>>>>,
    ctl_tx: mpsc::Sender<StreamCtl>,
}

impl Stream {
    pub fn peer_node(&self) -> &NodeId {
        &self.peer_node
    }

    /// Queue bytes for ordered delivery. Applies stream flow control:
    /// blocks while the in-flight window is full.
    pub async fn send(&self, data: &[u8]) -> NetResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.out_tx
            .send(data.to_vec())
            .await
            .map_err(|_| NetError::Closed)
    }

    /// Receive the next in-order run of bytes.
    pub async fn recv(&self, timeout: Duration) -> NetResult<Vec<u8>> {
        let mut rx = self.in_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(NetError::Closed),
            Err(_) => Err(NetError::Timeout),
        }
    }

    /// Finish sending: flushes queued data, sends FIN and waits for the
    /// handshake in the background. Receiving stays possible.
    pub async fn close(&self) {
        let _ = self.ctl_tx.send(StreamCtl::Close).await;
    }

    /// Abort immediately with RST.
    pub async fn abort(&self) {
        let _ = self.ctl_tx.send(StreamCtl::Abort).await;
    }
}

struct StreamActor {
    conn: PacketConn,
    peer_node: NodeId,
    peer_service: String,
    session: u64,
    send_win: SendWindow,
    reassembly: Reassembler,
    /// Fragments staged but not yet admitted to the window.
    outbox: VecDeque<OutItem>,
    user_in: Option<mpsc::Sender<NetResult<Vec<u8>>>>,
    user_out: mpsc::Receiver<Vec<u8>>,
    ctl_rx: mpsc::Receiver<StreamCtl>,
    fin_queued: bool,
    ctl_closed: bool,
    /// All user handles dropped; received data has no reader.
    user_gone: bool,
    local_fin_seq: Option<u64>,
    remote_fin_seen: bool,
    close_deadline: Option<Instant>,
}

enum OutItem {
    Data(Vec<u8>),
    Fin,
}

impl StreamActor {
    fn spawn(
        conn: PacketConn,
        peer_node: NodeId,
        peer_service: String,
        session: u64,
        next_seq: u64,
        recv_next: u64,
    ) -> Stream {
        let (out_tx, user_out) = mpsc::channel(4);
        let (user_in_tx, in_rx) = mpsc::channel(64);
        let (ctl_tx, ctl_rx) = mpsc::channel(4);
        let stream = Stream {
            peer_node: peer_node.clone(),
            out_tx,
            in_rx: Arc::new(Mutex::new(in_rx)),
            ctl_tx,
        };
        let actor = StreamActor {
            conn,
            peer_node,
            peer_service,
            session,
            send_win: SendWindow::new(next_seq),
            reassembly: Reassembler::new(recv_next),
            outbox: VecDeque::new(),
            user_in: Some(user_in_tx),
            user_out,
            ctl_rx,
            fin_queued: false,
            ctl_closed: false,
            user_gone: false,
            local_fin_seq: None,
            remote_fin_seen: false,
            close_deadline: None,
        };
        tokio::spawn(actor.run());
        stream
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let outcome = loop {
            if self.finished() {
                break Ok(());
            }
            let want_user_data = self.outbox.is_empty() && !self.fin_queued;
            tokio::select! {
                inbound = self.conn.recv(CLOSE_TIMEOUT) => match inbound {
                    Ok(datagram) => {
                        if let Err(e) = self.on_datagram(datagram).await {
                            break Err(e);
                        }
                    }
                    Err(NetError::Timeout) => {}
                    // Transient routing failure; retransmission decides
                    // whether the stream survives.
                    Err(NetError::Unreachable(_)) => {}
                    Err(e) => break Err(e),
                },
                maybe = self.user_out.recv(), if want_user_data => {
                    match maybe {
                        Some(data) => self.stage_data(data),
                        // Every user handle is gone: finish gracefully.
                        None => {
                            self.user_gone = true;
                            self.begin_close();
                        }
                    }
                    if let Err(e) = self.flush().await {
                        break Err(e);
                    }
                }
                ctl = self.ctl_rx.recv(), if !self.ctl_closed => {
                    match ctl {
                        Some(StreamCtl::Close) => self.begin_close(),
                        None => {
                            self.ctl_closed = true;
                            self.begin_close();
                        }
                        Some(StreamCtl::Abort) => {
                            let _ = self.send_chunk(0, FLAG_RST, Vec::new()).await;
                            break Err(NetError::Reset);
                        }
                    }
                    if let Err(e) = self.flush().await {
                        break Err(e);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.on_tick().await {
                        break Err(e);
                    }
                }
            }
        };
        match outcome {
            Ok(()) => trace!(peer = %self.peer_node, session = self.session, "stream finished"),
            Err(e) => {
                if !e.is_benign() {
                    debug!(peer = %self.peer_node, session = self.session, error = %e, "stream failed");
                }
                self.deliver(Err(e)).await;
            }
        }
        self.conn.close();
    }

    fn finished(&self) -> bool {
        let sent_everything = self.local_fin_seq.is_some() && self.send_win.all_acked();
        // With no user left there is nobody to read further inbound
        // data, so the peer's FIN is not worth waiting for.
        sent_everything && (self.remote_fin_seen || self.user_gone)
    }

    fn begin_close(&mut self) {
        if !self.fin_queued {
            self.fin_queued = true;
            self.outbox.push_back(OutItem::Fin);
            self.close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
        }
    }

    fn stage_data(&mut self, data: Vec<u8>) {
        for fragment in data.chunks(STREAM_MTU) {
            self.outbox.push_back(OutItem::Data(fragment.to_vec()));
        }
    }

    /// Admit staged fragments to the window and put them on the wire.
    async fn flush(&mut self) -> NetResult<()> {
        loop {
            match self.outbox.front() {
                Some(OutItem::Data(fragment)) if self.send_win.fits(fragment.len()) => {
                    let Some(OutItem::Data(fragment)) = self.outbox.pop_front() else {
                        unreachable!()
                    };
                    let (seq, flags, payload) = self.send_win.stage(FLAG_ACK, fragment);
                    self.send_chunk_seq(seq, flags, payload).await?;
                }
                Some(OutItem::Fin) if self.send_win.all_acked() || self.outbox.len() == 1 => {
                    self.outbox.pop_front();
                    let (seq, flags, payload) =
                        self.send_win.stage(FLAG_FIN | FLAG_ACK, Vec::new());
                    self.local_fin_seq = Some(seq);
                    self.send_chunk_seq(seq, flags, payload).await?;
                }
                _ => return Ok(()),
            }
        }
    }

    async fn on_datagram(&mut self, datagram: Datagram) -> NetResult<()> {
        let chunk = match decode_chunk(&datagram.payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "undecodable stream chunk dropped");
                return Ok(());
            }
        };
        if chunk.session != self.session {
            return Ok(());
        }
        if chunk.has(FLAG_RST) {
            return Err(NetError::Reset);
        }
        if chunk.has(FLAG_ACK) && self.send_win.apply_ack(chunk.ack) {
            self.flush().await?;
        }
        if chunk.is_pure_ack() {
            return Ok(());
        }
        // Data, FIN, or a retransmitted handshake chunk.
        let ready = self
            .reassembly
            .offer(chunk.seq, chunk.flags, chunk.payload);
        for (flags, payload) in ready {
            if !payload.is_empty() {
                self.deliver(Ok(payload)).await;
            }
            if flags & FLAG_FIN != 0 {
                self.remote_fin_seen = true;
                // End of the inbound byte stream.
                self.user_in = None;
            }
        }
        self.send_pure_ack().await;
        Ok(())
    }

    async fn on_tick(&mut self) -> NetResult<()> {
        if let Some((seq, flags, payload)) = self.send_win.due_for_retransmit()? {
            trace!(session = self.session, seq, "retransmitting chunk");
            self.send_chunk_seq(seq, flags, payload).await?;
        }
        if let Some(deadline) = self.close_deadline {
            if Instant::now() >= deadline {
                if self.local_fin_seq.is_some() && self.send_win.all_acked() {
                    // Our side finished cleanly; the peer may keep
                    // sending for as long as it likes (half-close).
                    self.close_deadline = None;
                } else {
                    let _ = self.send_chunk(0, FLAG_RST, Vec::new()).await;
                    return Err(NetError::Closed);
                }
            }
        }
        Ok(())
    }

    async fn deliver(&mut self, item: NetResult<Vec<u8>>) {
        if let Some(tx) = &self.user_in {
            if tx.send(item).await.is_err() {
                self.user_in = None;
            }
        }
    }

    async fn send_pure_ack(&self) {
        let _ = self.send_chunk(0, FLAG_ACK, Vec::new()).await;
    }

    async fn send_chunk_seq(&self, seq: u64, flags: u8, payload: Vec<u8>) -> NetResult<()> {
        let chunk = Chunk {
            session: self.session,
            seq,
            flags,
            ack: self.reassembly.ack(),
            payload,
        };
        match self
            .conn
            .send_to(&self.peer_node, &self.peer_service, encode_chunk(&chunk))
            .await
        {
            Ok(()) => Ok(()),
            // A route can vanish transiently while the mesh converges;
            // the chunk stays unacked and the retransmit timer covers
            // it. Only a closed endpoint is fatal here.
            Err(NetError::Unreachable(node)) => {
                trace!(peer = %node, seq, "no route right now, leaving chunk to retransmission");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send_chunk(&self, seq: u64, flags: u8, payload: Vec<u8>) -> NetResult<()> {
        self.send_chunk_seq(seq, flags, payload).await
    }
}

// ----------------------------------------------------------------------------
// Dial and accept
// ----------------------------------------------------------------------------

pub(crate) struct CircuitParts {
    pub engine: EngineHandle,
    pub registry: Arc<ServiceRegistry>,
    pub local_node: NodeId,
}

impl CircuitParts {
    pub(crate) fn bind_ephemeral(&self) -> NetResult<PacketConn> {
        for _ in 0..8 {
            let name = ephemeral_service();
            match self.registry.bind_internal(&name) {
                Ok(rx) => {
                    return Ok(PacketConn::new(
                        self.engine.clone(),
                        self.registry.clone(),
                        self.local_node.clone(),
                        name,
                        false,
                        rx,
                    ))
                }
                Err(NetError::NameInUse(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(NetError::Config("could not allocate a stream endpoint".into()))
    }

    /// Open a reliable stream to a remote service.
    pub(crate) async fn dial(
        &self,
        node: NodeId,
        service: &str,
        timeout: Duration,
    ) -> NetResult<Stream> {
        let conn = self.bind_ephemeral()?;
        let session: u64 = rand::thread_rng().gen();
        let syn = Chunk {
            session,
            seq: 0,
            flags: FLAG_SYN,
            ack: 0,
            payload: Vec::new(),
        };
        let deadline = Instant::now() + timeout;
        conn.send_to(&node, service, encode_chunk(&syn)).await?;
        let mut next_resend = Instant::now() + RETRANSMIT_AFTER;

        // Wait for the SYN|ACK that names the peer's stream endpoint.
        let peer_service = loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(NetError::Timeout);
            }
            let wait = next_resend.min(deadline).saturating_duration_since(now);
            match conn.recv(wait.max(Duration::from_millis(1))).await {
                Ok(datagram) => {
                    let Ok(chunk) = decode_chunk(&datagram.payload) else {
                        continue;
                    };
                    if chunk.session != session {
                        continue;
                    }
                    if chunk.has(FLAG_RST) {
                        return Err(NetError::Reset);
                    }
                    if chunk.has(FLAG_SYN) && chunk.has(FLAG_ACK) {
                        break datagram.from_service;
                    }
                }
                Err(NetError::Timeout) => {
                    conn.send_to(&node, service, encode_chunk(&syn)).await?;
                    next_resend = Instant::now() + RETRANSMIT_AFTER;
                }
                Err(e) => return Err(e),
            }
        };

        // Ack their SYN|ACK so the peer can settle.
        let ack = Chunk {
            session,
            seq: 0,
            flags: FLAG_ACK,
            ack: 1,
            payload: Vec::new(),
        };
        conn.send_to(&node, &peer_service, encode_chunk(&ack))
            .await?;
        debug!(peer = %node, service, session, "stream established");
        Ok(StreamActor::spawn(conn, node, peer_service, session, 1, 1))
    }
}

/// Accepts inbound streams on an advertised service.
pub struct StreamListener {
    parts: CircuitParts,
    conn: PacketConn,
    /// Recently accepted sessions, so a retransmitted SYN re-announces
    /// the existing stream endpoint instead of spawning a twin.
    recent: Mutex<VecDeque<(u64, String)>>,
}

/// Sessions remembered for SYN retransmission handling.
const RECENT_SESSIONS: usize = 256;

impl StreamListener {
    pub(crate) fn new(parts: CircuitParts, conn: PacketConn) -> Self {
        StreamListener {
            parts,
            conn,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn local_service(&self) -> &str {
        self.conn.local_service()
    }

    /// Wait for the next inbound stream.
    pub async fn accept(&self) -> NetResult<Stream> {
        loop {
            let datagram = self.conn.recv(Duration::from_secs(3600)).await?;
            let Ok(chunk) = decode_chunk(&datagram.payload) else {
                continue;
            };
            if !chunk.has(FLAG_SYN) || chunk.has(FLAG_ACK) {
                continue;
            }

            let mut recent = self.recent.lock().await;
            if let Some((_, endpoint)) = recent.iter().find(|(s, _)| *s == chunk.session) {
                // SYN retransmit: our SYN|ACK was lost. Resend it from
                // the already-bound endpoint.
                let reply = Chunk {
                    session: chunk.session,
                    seq: 0,
                    flags: FLAG_SYN | FLAG_ACK,
                    ack: 1,
                    payload: Vec::new(),
                };
                self.parts
                    .engine
                    .send_data(DataFrame {
                        src_node: self.parts.local_node.clone(),
                        dst_node: datagram.from_node.clone(),
                        src_service: endpoint.clone(),
                        dst_service: datagram.from_service.clone(),
                        ttl: DEFAULT_TTL,
                        payload: encode_chunk(&reply),
                    })
                    .await;
                continue;
            }

            let conn = self.parts.bind_ephemeral()?;
            recent.push_back((chunk.session, conn.local_service().to_string()));
            if recent.len() > RECENT_SESSIONS {
                recent.pop_front();
            }
            drop(recent);

            let reply = Chunk {
                session: chunk.session,
                seq: 0,
                flags: FLAG_SYN | FLAG_ACK,
                ack: 1,
                payload: Vec::new(),
            };
            conn.send_to(
                &datagram.from_node,
                &datagram.from_service,
                encode_chunk(&reply),
            )
            .await?;
            debug!(
                peer = %datagram.from_node,
                session = chunk.session,
                "stream accepted"
            );
            return Ok(StreamActor::spawn(
                conn,
                datagram.from_node,
                datagram.from_service,
                chunk.session,
                1,
                1,
            ));
        }
    }

    /// Stop listening; releases the advertised binding.
    pub fn close(&self) {
        self.conn.close();
    }
}
