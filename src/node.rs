//! The node facade: one mesh participant as an explicit value.
//!
//! A [`Node`] ties the pieces together: it owns the routing engine and
//! service registry, attaches backends, spawns a link task per incoming
//! session and exposes the circuit API (datagrams, streams, ping).
//! Handles are cheap to clone; every component receives the handle it
//! needs rather than reaching for process-wide state, so tests build
//! several nodes in one process.
//!
//! Backend lifecycle: [`Node::attach_backend`] starts the backend and
//! tracks its accept/dial task. [`Node::wait_backends`] resolves when
//! every attached backend has ended, which the binary combines with a
//! short grace window to distinguish "nothing configured" from "all
//! backends failed at startup".

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::{Backend, Shutdown};
use crate::circuit::{CircuitParts, PacketConn, Stream, StreamListener, DIAL_TIMEOUT};
use crate::control::{run_control, ReloadFn};
use crate::error::{NetError, NetResult};
use crate::identity::{AllowedPeers, NodeId};
use crate::link::{run_link, LinkConfig, KEEPALIVE_INTERVAL};
use crate::routing::{spawn_engine, EngineCmd, EngineHandle, EngineStatus, RoutingSnapshot};
use crate::services::ServiceRegistry;

/// Internal echo responder used by `ping`.
const PING_SERVICE: &str = "\u{1}ping";

/// Everything needed to construct a node.
#[derive(Clone, Debug)]
pub struct NodeSettings {
    pub id: NodeId,
    pub allowed_peers: AllowedPeers,
    pub keepalive: Duration,
    /// Opaque path handed to external state-bearing consumers.
    pub data_dir: Option<PathBuf>,
}

impl NodeSettings {
    pub fn new(id: NodeId) -> Self {
        NodeSettings {
            id,
            allowed_peers: AllowedPeers::any(),
            keepalive: KEEPALIVE_INTERVAL,
            data_dir: None,
        }
    }

    pub fn allowed_peers(mut self, peers: AllowedPeers) -> Self {
        self.allowed_peers = peers;
        self
    }

    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    pub fn data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }
}

/// One mesh participant. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    id: NodeId,
    allowed_peers: AllowedPeers,
    keepalive: Duration,
    data_dir: Option<PathBuf>,
    engine: EngineHandle,
    registry: Arc<ServiceRegistry>,
    shutdown: Shutdown,
    backends_started: AtomicUsize,
    backends_active: AtomicUsize,
    backends_idle: Notify,
}

impl Node {
    /// Build a node and start its routing engine and internal services.
    pub fn new(settings: NodeSettings) -> Node {
        let registry = Arc::new(ServiceRegistry::new());
        let shutdown = Shutdown::new();
        let engine = spawn_engine(settings.id.clone(), registry.clone(), shutdown.clone());
        let node = Node {
            inner: Arc::new(NodeInner {
                id: settings.id,
                allowed_peers: settings.allowed_peers,
                keepalive: settings.keepalive,
                data_dir: settings.data_dir,
                engine,
                registry,
                shutdown,
                backends_started: AtomicUsize::new(0),
                backends_active: AtomicUsize::new(0),
                backends_idle: Notify::new(),
            }),
        };
        node.spawn_ping_responder();
        info!(node = %node.node_id(), "node started");
        node
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn data_dir(&self) -> Option<&PathBuf> {
        self.inner.data_dir.as_ref()
    }

    /// Process-wide cancellation: closes sessions, downs links, stops
    /// backends.
    pub fn shutdown(&self) {
        info!(node = %self.inner.id, "shutting down");
        self.inner.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub async fn wait_shutdown(&self) {
        self.inner.shutdown.cancelled().await;
    }

    // ------------------------------------------------------------------
    // Backends
    // ------------------------------------------------------------------

    /// Start a backend and run a link per session it produces.
    ///
    /// `cost` is our suggested cost for links on this backend and must
    /// be positive, as must every per-peer override. Returns a backend
    /// id usable with [`set_backend_cost`](Self::set_backend_cost).
    pub async fn attach_backend(
        &self,
        backend: Box<dyn Backend>,
        cost: f64,
        node_costs: HashMap<NodeId, f64>,
    ) -> NetResult<usize> {
        if !(cost > 0.0) {
            return Err(NetError::Config(format!(
                "connection cost must be positive, got {cost}"
            )));
        }
        for (peer, c) in &node_costs {
            if !(*c > 0.0) {
                return Err(NetError::Config(format!(
                    "connection cost must be positive for {peer}, got {c}"
                )));
            }
        }
        let label = backend.label();
        let backend_id = self.inner.backends_started.fetch_add(1, Ordering::SeqCst);
        let mut sessions = backend.start(self.inner.shutdown.clone()).await?;
        self.inner.backends_active.fetch_add(1, Ordering::SeqCst);
        info!(node = %self.inner.id, backend = %label, "backend attached");

        let link_cfg = LinkConfig {
            local_id: self.inner.id.clone(),
            backend: backend_id,
            cost,
            node_costs,
            allowed_peers: self.inner.allowed_peers.clone(),
            keepalive: self.inner.keepalive,
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            // Keep the backend value alive for as long as it runs.
            let _backend = backend;
            while let Some(session) = sessions.recv().await {
                tokio::spawn(run_link(
                    link_cfg.clone(),
                    session,
                    inner.engine.clone(),
                    inner.shutdown.clone(),
                ));
            }
            debug!(backend = %label, "backend ended");
            if inner.backends_active.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.backends_idle.notify_waiters();
            }
        });
        Ok(backend_id)
    }

    /// Number of backends ever attached.
    pub fn backend_count(&self) -> usize {
        self.inner.backends_started.load(Ordering::SeqCst)
    }

    /// Resolve once every attached backend has stopped producing
    /// sessions. Resolves immediately when none are running.
    pub async fn wait_backends(&self) {
        loop {
            let notified = self.inner.backends_idle.notified();
            if self.inner.backends_active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Re-cost links attached through one backend (config reload).
    /// Returns how many link costs actually changed; changes re-flood
    /// under a fresh generation.
    pub async fn set_backend_cost(
        &self,
        backend_id: usize,
        cost: f64,
        node_costs: HashMap<NodeId, f64>,
    ) -> NetResult<usize> {
        if !(cost > 0.0) {
            return Err(NetError::Config(format!(
                "connection cost must be positive, got {cost}"
            )));
        }
        self.inner
            .engine
            .set_backend_cost(backend_id, cost, node_costs)
            .await
    }

    // ------------------------------------------------------------------
    // Routing views
    // ------------------------------------------------------------------

    pub fn routing_snapshot(&self) -> Arc<RoutingSnapshot> {
        self.inner.engine.snapshot()
    }

    /// Watch receiver over routing snapshots, for convergence waits.
    pub fn routing_watch(&self) -> tokio::sync::watch::Receiver<Arc<RoutingSnapshot>> {
        self.inner.engine.snapshot_rx()
    }

    pub async fn status(&self) -> NetResult<EngineStatus> {
        self.inner.engine.status().await
    }

    // ------------------------------------------------------------------
    // Circuits
    // ------------------------------------------------------------------

    fn parts(&self) -> CircuitParts {
        CircuitParts {
            engine: self.inner.engine.clone(),
            registry: self.inner.registry.clone(),
            local_node: self.inner.id.clone(),
        }
    }

    /// Bind a datagram endpoint without advertising it.
    pub fn listen_packet(&self, service: &str) -> NetResult<PacketConn> {
        let rx = self.inner.registry.bind(service)?;
        Ok(PacketConn::new(
            self.inner.engine.clone(),
            self.inner.registry.clone(),
            self.inner.id.clone(),
            service.to_string(),
            false,
            rx,
        ))
    }

    /// Bind a datagram endpoint and flood its advert across the mesh.
    pub async fn listen_and_advertise(
        &self,
        service: &str,
        tags: impl IntoIterator<Item = (String, String)>,
    ) -> NetResult<PacketConn> {
        let rx = self.inner.registry.bind(service)?;
        self.inner
            .engine
            .send(EngineCmd::AdvertiseService {
                service: service.to_string(),
                tags: tags.into_iter().collect(),
            })
            .await;
        Ok(PacketConn::new(
            self.inner.engine.clone(),
            self.inner.registry.clone(),
            self.inner.id.clone(),
            service.to_string(),
            true,
            rx,
        ))
    }

    /// Accept reliable streams on an advertised service.
    pub async fn listen_stream(
        &self,
        service: &str,
        tags: impl IntoIterator<Item = (String, String)>,
    ) -> NetResult<StreamListener> {
        let conn = self.listen_and_advertise(service, tags).await?;
        Ok(StreamListener::new(self.parts(), conn))
    }

    /// Open a reliable stream to a service on another node.
    pub async fn dial(&self, node: &NodeId, service: &str) -> NetResult<Stream> {
        self.dial_timeout(node, service, DIAL_TIMEOUT).await
    }

    pub async fn dial_timeout(
        &self,
        node: &NodeId,
        service: &str,
        timeout: Duration,
    ) -> NetResult<Stream> {
        self.parts().dial(node.clone(), service, timeout).await
    }

    /// Round-trip probe against another node's internal echo responder.
    pub async fn ping(&self, node: &NodeId, timeout: Duration) -> NetResult<Duration> {
        let conn = self.parts().bind_ephemeral()?;
        let started = Instant::now();
        let token = rand::random::<u64>().to_be_bytes().to_vec();
        conn.send_to(node, PING_SERVICE, token.clone()).await?;
        let deadline = started + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NetError::Timeout);
            }
            let datagram = conn.recv(remaining).await?;
            if datagram.from_node == *node && datagram.payload == token {
                return Ok(started.elapsed());
            }
        }
    }

    /// Serve the control protocol on `service` in the background.
    pub fn start_control(&self, service: &str, reload: Option<ReloadFn>) {
        let node = self.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            if let Err(e) = run_control(node, service, reload).await {
                debug!(error = %e, "control service stopped");
            }
        });
    }

    fn spawn_ping_responder(&self) {
        let registry = self.inner.registry.clone();
        let rx = registry
            .bind_internal(PING_SERVICE)
            .expect("ping responder binds on a fresh node");
        let conn = PacketConn::new(
            self.inner.engine.clone(),
            registry,
            self.inner.id.clone(),
            PING_SERVICE.to_string(),
            false,
            rx,
        );
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = conn.recv(Duration::from_secs(3600)) => match res {
                        Ok(datagram) => {
                            let _ = conn
                                .send_to(&datagram.from_node, &datagram.from_service, datagram.payload)
                                .await;
                        }
                        Err(NetError::Timeout) => {}
                        Err(_) => break,
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("backends", &self.backend_count())
            .finish()
    }
}
