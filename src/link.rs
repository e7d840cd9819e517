//! Link endpoints: the peer-to-peer protocol on one backend session.
//!
//! A link starts with an immediate hello exchange. Each side sends
//! `InitialHello { node_id, suggested cost }`; the link is *up* once
//! both helloes are validated. Validation rejects a peer claiming our
//! own ID, an invalid ID, or — when an allowlist is configured — an ID
//! not on it; rejected sessions are closed with a logged reason and
//! never touch routing state.
//!
//! The effective link cost is the max of the two suggestions, unless a
//! local per-peer override pins it. After the handshake the link task
//! demultiplexes inbound frames to the routing engine, refreshes its
//! liveness deadline on every arrival, and sends a keepalive each
//! interval. Three silent intervals declare the link down.
//!
//! States: `Connecting → HandshakeSent → Up → Down`. Only
//! `HandshakeSent→Up` and `Up→Down` are reported to the engine.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{SessionRef, Shutdown};
use crate::error::{NetError, NetResult};
use crate::frame::Frame;
use crate::identity::{AllowedPeers, NodeId};
use crate::routing::{EngineCmd, EngineHandle, LINK_SEND_QUEUE};

/// Default keepalive cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Silent intervals tolerated before the link is declared down.
const KEEPALIVE_MISSES: u32 = 3;

/// Per-link parameters handed down from the node facade.
#[derive(Clone)]
pub(crate) struct LinkConfig {
    pub local_id: NodeId,
    /// Index of the backend this session came from.
    pub backend: usize,
    /// Our suggested cost for links on this backend.
    pub cost: f64,
    /// Per-peer cost overrides; these beat negotiation.
    pub node_costs: HashMap<NodeId, f64>,
    pub allowed_peers: AllowedPeers,
    pub keepalive: Duration,
}

impl LinkConfig {
    fn liveness_deadline(&self) -> Duration {
        self.keepalive * KEEPALIVE_MISSES
    }
}

/// Drive one session as a mesh link until it goes down.
pub(crate) async fn run_link(
    cfg: LinkConfig,
    session: SessionRef,
    engine: EngineHandle,
    shutdown: Shutdown,
) {
    let (peer, negotiated, remote_suggest) = match handshake(&cfg, &session).await {
        Ok(ok) => ok,
        Err(e) => {
            if e.is_benign() {
                debug!(error = %e, "handshake did not complete");
            } else {
                warn!(error = %e, "handshake rejected");
            }
            session.close().await;
            return;
        }
    };

    let link_id: u64 = rand::random();
    let (queue_tx, mut queue_rx) = mpsc::channel::<Vec<u8>>(LINK_SEND_QUEUE);
    engine
        .send(EngineCmd::LinkUp {
            peer: peer.clone(),
            link_id,
            backend: cfg.backend,
            negotiated,
            remote_suggest,
            queue: queue_tx,
        })
        .await;

    // Writer half: drain the engine's per-link queue onto the session.
    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        while let Some(bytes) = queue_rx.recv().await {
            if let Err(e) = writer_session.send(&bytes).await {
                if !e.is_benign() {
                    debug!(error = %e, "link writer stopped");
                }
                break;
            }
        }
    });

    let keepalive_bytes = Frame::Keepalive
        .encode()
        .expect("keepalive frame always encodes");
    let mut last_heard = Instant::now();
    let mut ticker = tokio::time::interval(cfg.keepalive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break "shutdown",
            _ = ticker.tick() => {
                if last_heard.elapsed() >= cfg.liveness_deadline() {
                    break "keepalive deadline exceeded";
                }
                if session.send(&keepalive_bytes).await.is_err() {
                    break "session closed";
                }
            }
            res = session.recv(cfg.keepalive) => match res {
                Ok(bytes) => {
                    last_heard = Instant::now();
                    match Frame::decode(&bytes) {
                        Ok(Frame::Keepalive) => {}
                        Ok(frame @ (Frame::RoutingUpdate(_) | Frame::ServiceAdvert(_))) => {
                            engine.send(EngineCmd::Advert { via: peer.clone(), frame }).await;
                        }
                        Ok(frame @ (Frame::Data(_) | Frame::Unreachable(_))) => {
                            engine.send(EngineCmd::Inbound { frame }).await;
                        }
                        Ok(Frame::InitialHello { .. }) => {
                            warn!(peer = %peer, "unexpected hello after handshake");
                            break "protocol error";
                        }
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "undecodable frame");
                            break "protocol error";
                        }
                    }
                }
                Err(NetError::Timeout) => {} // liveness is checked on the tick
                Err(NetError::Closed) => break "closed by peer",
                Err(e) => {
                    debug!(peer = %peer, error = %e, "transport failure");
                    break "transport error";
                }
            }
        }
    };

    info!(peer = %peer, reason, "link down");
    session.close().await;
    writer.abort();
    engine.send(EngineCmd::LinkDown { peer, link_id }).await;
}

/// Exchange and validate helloes. Returns the peer's ID, the effective
/// link cost and the peer's suggested cost.
async fn handshake(cfg: &LinkConfig, session: &SessionRef) -> NetResult<(NodeId, f64, f64)> {
    session
        .send(
            &Frame::InitialHello {
                node_id: cfg.local_id.clone(),
                cost: cfg.cost,
            }
            .encode()?,
        )
        .await?;

    let deadline = Instant::now() + cfg.liveness_deadline();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(NetError::Timeout);
        }
        let bytes = session.recv(remaining).await?;
        match Frame::decode(&bytes)? {
            Frame::InitialHello { node_id, cost } => {
                // Decoding already validated and normalized the ID.
                let peer = node_id;
                if peer == cfg.local_id {
                    return Err(NetError::PolicyReject(format!(
                        "peer claims our own node ID {peer}"
                    )));
                }
                if !(cost > 0.0) {
                    return Err(NetError::PolicyReject(format!(
                        "peer {peer} suggested non-positive cost {cost}"
                    )));
                }
                if !cfg.allowed_peers.permits(&peer) {
                    return Err(NetError::PolicyReject(format!(
                        "peer {peer} is not in the allowed peers list"
                    )));
                }
                let negotiated = cfg
                    .node_costs
                    .get(&peer)
                    .copied()
                    .unwrap_or_else(|| cfg.cost.max(cost));
                return Ok((peer, negotiated, cost));
            }
            // A keepalive racing ahead of the hello is harmless.
            Frame::Keepalive => continue,
            other => {
                return Err(NetError::PolicyReject(format!(
                    "frame tag {} before hello",
                    other.tag()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendSession;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// In-memory session pair for exercising the link protocol without
    /// sockets.
    struct ChanSession {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        closed: AtomicBool,
    }

    fn session_pair() -> (SessionRef, SessionRef) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(ChanSession {
            tx: a_tx,
            rx: Mutex::new(b_rx),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(ChanSession {
            tx: b_tx,
            rx: Mutex::new(a_rx),
            closed: AtomicBool::new(false),
        });
        (a, b)
    }

    #[async_trait]
    impl BackendSession for ChanSession {
        async fn send(&self, frame: &[u8]) -> NetResult<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(NetError::Closed);
            }
            self.tx
                .send(frame.to_vec())
                .map_err(|_| NetError::Closed)
        }

        async fn recv(&self, timeout: Duration) -> NetResult<Vec<u8>> {
            if self.closed.load(Ordering::Acquire) {
                return Err(NetError::Closed);
            }
            let mut rx = self.rx.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => Err(NetError::Closed),
                Err(_) => Err(NetError::Timeout),
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    fn cfg(id: &str, allowed: &[&str]) -> LinkConfig {
        LinkConfig {
            local_id: NodeId::parse(id).unwrap(),
            backend: 0,
            cost: 1.0,
            node_costs: HashMap::new(),
            allowed_peers: if allowed.is_empty() {
                AllowedPeers::any()
            } else {
                AllowedPeers::from_ids(allowed.iter().map(|s| NodeId::parse(s).unwrap()))
            },
            keepalive: Duration::from_millis(50),
        }
    }

    async fn peer_sends_hello(session: &SessionRef, id: &str, cost: f64) {
        session
            .send(
                &Frame::InitialHello {
                    node_id: NodeId::parse(id).unwrap(),
                    cost,
                }
                .encode()
                .unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn handshake_negotiates_max_cost() {
        let (ours, theirs) = session_pair();
        peer_sends_hello(&theirs, "b", 4.0).await;
        let (peer, negotiated, remote) = handshake(&cfg("a", &[]), &ours).await.unwrap();
        assert_eq!(peer, NodeId::parse("b").unwrap());
        assert_eq!(negotiated, 4.0);
        assert_eq!(remote, 4.0);
        // Our own hello reached the peer.
        let sent = theirs.recv(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            Frame::decode(&sent).unwrap(),
            Frame::InitialHello { .. }
        ));
    }

    #[tokio::test]
    async fn node_cost_override_beats_negotiation() {
        let (ours, theirs) = session_pair();
        peer_sends_hello(&theirs, "b", 9.0).await;
        let mut config = cfg("a", &[]);
        config
            .node_costs
            .insert(NodeId::parse("b").unwrap(), 2.5);
        let (_, negotiated, _) = handshake(&config, &ours).await.unwrap();
        assert_eq!(negotiated, 2.5);
    }

    #[tokio::test]
    async fn allowed_peers_rejects_stranger() {
        let (ours, theirs) = session_pair();
        peer_sends_hello(&theirs, "c", 1.0).await;
        let err = handshake(&cfg("a", &["b"]), &ours).await.unwrap_err();
        assert!(matches!(err, NetError::PolicyReject(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn self_id_rejected() {
        let (ours, theirs) = session_pair();
        peer_sends_hello(&theirs, "a", 1.0).await;
        let err = handshake(&cfg("a", &[]), &ours).await.unwrap_err();
        assert!(matches!(err, NetError::PolicyReject(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out_after_three_intervals() {
        let (ours, _theirs) = session_pair();
        let started = Instant::now();
        let err = handshake(&cfg("a", &[]), &ours).await.unwrap_err();
        assert!(matches!(err, NetError::Timeout));
        let waited = started.elapsed();
        assert!(
            waited >= Duration::from_millis(150),
            "gave up too early: {waited:?}"
        );
    }

    #[tokio::test]
    async fn early_keepalive_is_tolerated() {
        let (ours, theirs) = session_pair();
        theirs
            .send(&Frame::Keepalive.encode().unwrap())
            .await
            .unwrap();
        peer_sends_hello(&theirs, "b", 1.0).await;
        assert!(handshake(&cfg("a", &[]), &ours).await.is_ok());
    }

    #[tokio::test]
    async fn data_before_hello_is_a_protocol_error() {
        let (ours, theirs) = session_pair();
        theirs
            .send(
                &Frame::Data(crate::frame::DataFrame {
                    src_node: NodeId::parse("c").unwrap(),
                    dst_node: NodeId::parse("a").unwrap(),
                    src_service: "s".into(),
                    dst_service: "d".into(),
                    ttl: 3,
                    payload: vec![],
                })
                .encode()
                .unwrap(),
            )
            .await
            .unwrap();
        let err = handshake(&cfg("a", &[]), &ours).await.unwrap_err();
        assert!(matches!(err, NetError::PolicyReject(_)));
    }
}
