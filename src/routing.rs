//! The routing engine: topology flooding, shortest paths, forwarding.
//!
//! The engine is an actor. A cheap-to-clone [`EngineHandle`] feeds it
//! commands over a channel; the actor task owns every piece of mutable
//! routing state and processes events strictly in arrival order, which
//! is what makes generation checks and recomputation race-free. Readers
//! never touch the live state: after every change the engine publishes
//! an immutable [`RoutingSnapshot`] through a watch channel.
//!
//! ## Topology exchange
//!
//! Each node floods a [`RoutingUpdate`] naming its direct neighbors and
//! negotiated costs, stamped with a monotonically increasing per-origin
//! generation. Receivers drop stale generations, fold fresh updates
//! into the connection graph, recompute shortest paths (Dijkstra,
//! deterministic lexicographic next-hop tie-break) and re-flood the
//! update on every other up link. Service adverts flood the same way
//! under per-(origin, service) generations.
//!
//! When a new link comes up the engine replays its latest stored update
//! from every known origin (and every directory advert) onto that link,
//! so late joiners converge without waiting for the next natural flood.
//!
//! ## Forwarding
//!
//! Data frames either terminate here (service dispatch) or hop to the
//! next link with their TTL decremented. Failures — no route, hop limit,
//! unbound service — route an [`UnreachableInfo`] notice back toward
//! the frame's source; notices carry the same hop budget as data frames
//! and never themselves generate notices.

use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::backend::Shutdown;
use crate::error::{NetError, NetResult};
use crate::frame::{DataFrame, Frame, RoutingUpdate, ServiceAdvert, UnreachableInfo, DEFAULT_TTL};
use crate::identity::NodeId;
use crate::services::{DispatchOutcome, ServiceRegistry, UnreachableNotice};

/// Engine command queue depth.
const ENGINE_QUEUE: usize = 256;

/// Per-link outbound queue depth. The engine only ever `try_send`s into
/// these, so a stalled link sheds frames instead of stalling routing.
pub(crate) const LINK_SEND_QUEUE: usize = 64;

/// How long a flooded service advert stays valid.
const ADVERT_LIFETIME: Duration = Duration::from_secs(1800);

/// Cadence for re-flooding our own state (route update and adverts).
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One routing-table entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub next_hop: NodeId,
    pub cost: f64,
}

/// Directory entry for one advertised service.
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub tags: BTreeMap<String, String>,
    pub expires_ms: u64,
}

/// Immutable view of the routing state, published after every change.
#[derive(Clone, Debug, Default)]
pub struct RoutingSnapshot {
    pub routes: HashMap<NodeId, Route>,
    pub services: HashMap<(NodeId, String), ServiceInfo>,
}

impl RoutingSnapshot {
    pub fn route_to(&self, dst: &NodeId) -> Option<&Route> {
        self.routes.get(dst)
    }

    /// Nodes advertising the given service, for directory lookups.
    pub fn providers_of(&self, service: &str) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .services
            .keys()
            .filter(|(_, s)| s == service)
            .map(|(n, _)| n.clone())
            .collect();
        nodes.sort();
        nodes
    }
}

/// Point-in-time status for the control channel.
#[derive(Clone, Debug)]
pub struct EngineStatus {
    pub node_id: NodeId,
    pub generation: u64,
    pub up_links: Vec<(NodeId, f64)>,
    pub routes: Vec<(NodeId, Route)>,
    pub services: Vec<(NodeId, String)>,
}

pub(crate) enum EngineCmd {
    LinkUp {
        peer: NodeId,
        /// Unique per link task; lets the engine ignore a down
        /// notification from a link that was already replaced.
        link_id: u64,
        backend: usize,
        negotiated: f64,
        remote_suggest: f64,
        queue: mpsc::Sender<Vec<u8>>,
    },
    LinkDown {
        peer: NodeId,
        link_id: u64,
    },
    /// Routing update or service advert received on the link to `via`.
    Advert {
        via: NodeId,
        frame: Frame,
    },
    /// Data or unreachable frame received on a link.
    Inbound {
        frame: Frame,
    },
    /// Locally originated data frame.
    SendData {
        frame: DataFrame,
    },
    AdvertiseService {
        service: String,
        tags: BTreeMap<String, String>,
    },
    WithdrawService {
        service: String,
    },
    /// Re-cost every link belonging to one backend (config reload).
    /// Replies with the number of links whose cost actually changed.
    SetBackendCost {
        backend: usize,
        cost: f64,
        node_costs: HashMap<NodeId, f64>,
        reply: oneshot::Sender<usize>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-able handle to the engine actor.
#[derive(Clone)]
pub struct EngineHandle {
    cmd: mpsc::Sender<EngineCmd>,
    snapshot: watch::Receiver<Arc<RoutingSnapshot>>,
}

impl EngineHandle {
    /// Current routing snapshot; lookup only, never blocks.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Watch receiver for convergence waits.
    pub fn snapshot_rx(&self) -> watch::Receiver<Arc<RoutingSnapshot>> {
        self.snapshot.clone()
    }

    pub(crate) async fn send(&self, cmd: EngineCmd) {
        if self.cmd.send(cmd).await.is_err() {
            debug!("routing engine is gone, command dropped");
        }
    }

    pub(crate) async fn send_data(&self, frame: DataFrame) {
        self.send(EngineCmd::SendData { frame }).await;
    }

    /// Best-effort withdraw for drop paths, where awaiting is not an
    /// option.
    pub(crate) fn try_withdraw(&self, service: &str) {
        let _ = self.cmd.try_send(EngineCmd::WithdrawService {
            service: service.to_string(),
        });
    }

    pub async fn status(&self) -> NetResult<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCmd::Status { reply }).await;
        rx.await.map_err(|_| NetError::Closed)
    }

    pub(crate) async fn set_backend_cost(
        &self,
        backend: usize,
        cost: f64,
        node_costs: HashMap<NodeId, f64>,
    ) -> NetResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCmd::SetBackendCost {
            backend,
            cost,
            node_costs,
            reply,
        })
        .await;
        rx.await.map_err(|_| NetError::Closed)
    }
}

/// Spawn the engine actor for one node.
pub(crate) fn spawn_engine(
    node_id: NodeId,
    registry: Arc<ServiceRegistry>,
    shutdown: Shutdown,
) -> EngineHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(ENGINE_QUEUE);
    let (snap_tx, snap_rx) = watch::channel(Arc::new(RoutingSnapshot::default()));
    let engine = Engine {
        node_id,
        registry,
        links: HashMap::new(),
        graph: HashMap::new(),
        generations: HashMap::new(),
        // Seeded from the clock so a restarted node's floods always
        // supersede whatever generation peers remember for it.
        my_generation: now_ms(),
        advert_gens: HashMap::new(),
        directory: HashMap::new(),
        local_services: HashMap::new(),
        routes: HashMap::new(),
        snapshot_tx: snap_tx,
    };
    tokio::spawn(engine.run(cmd_rx, shutdown));
    EngineHandle {
        cmd: cmd_tx,
        snapshot: snap_rx,
    }
}

struct LinkHandle {
    link_id: u64,
    backend: usize,
    negotiated: f64,
    remote_suggest: f64,
    queue: mpsc::Sender<Vec<u8>>,
}

struct Engine {
    node_id: NodeId,
    registry: Arc<ServiceRegistry>,
    links: HashMap<NodeId, LinkHandle>,
    /// Latest advertised neighbor set per remote origin.
    graph: HashMap<NodeId, HashMap<NodeId, f64>>,
    /// Highest generation seen per origin.
    generations: HashMap<NodeId, u64>,
    my_generation: u64,
    /// Highest generation seen per (origin, service).
    advert_gens: HashMap<(NodeId, String), u64>,
    directory: HashMap<(NodeId, String), ServiceInfo>,
    /// Locally bound advertised services: tags and our advert generation.
    local_services: HashMap<String, (BTreeMap<String, String>, u64)>,
    routes: HashMap<NodeId, Route>,
    snapshot_tx: watch::Sender<Arc<RoutingSnapshot>>,
}

impl Engine {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<EngineCmd>, shutdown: Shutdown) {
        let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = refresh.tick() => self.refresh(),
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        debug!(node = %self.node_id, "routing engine stopped");
    }

    fn handle(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::LinkUp {
                peer,
                link_id,
                backend,
                negotiated,
                remote_suggest,
                queue,
            } => self.link_up(peer, link_id, backend, negotiated, remote_suggest, queue),
            EngineCmd::LinkDown { peer, link_id } => self.link_down(&peer, link_id),
            EngineCmd::Advert { via, frame } => self.on_advert(via, frame),
            EngineCmd::Inbound { frame } => match frame {
                Frame::Data(data) => self.forward(data),
                Frame::Unreachable(info) => self.forward_notice(info),
                other => warn!(tag = other.tag(), "non-data frame on the data path"),
            },
            EngineCmd::SendData { frame } => self.forward(frame),
            EngineCmd::AdvertiseService { service, tags } => self.advertise_service(service, tags),
            EngineCmd::WithdrawService { service } => self.withdraw_service(&service),
            EngineCmd::SetBackendCost {
                backend,
                cost,
                node_costs,
                reply,
            } => {
                let changed = self.set_backend_cost(backend, cost, &node_costs);
                let _ = reply.send(changed);
            }
            EngineCmd::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    // ------------------------------------------------------------------
    // Link lifecycle
    // ------------------------------------------------------------------

    fn link_up(
        &mut self,
        peer: NodeId,
        link_id: u64,
        backend: usize,
        negotiated: f64,
        remote_suggest: f64,
        queue: mpsc::Sender<Vec<u8>>,
    ) {
        info!(node = %self.node_id, peer = %peer, cost = negotiated, "link up");
        self.links.insert(
            peer.clone(),
            LinkHandle {
                link_id,
                backend,
                negotiated,
                remote_suggest,
                queue,
            },
        );
        self.replay_state_to(&peer);
        self.advertise_self();
        self.recompute();
        self.publish();
    }

    fn link_down(&mut self, peer: &NodeId, link_id: u64) {
        // A link that was replaced (simultaneous dial and accept, say)
        // reports down for a session the engine no longer tracks.
        match self.links.get(peer) {
            Some(link) if link.link_id == link_id => {}
            _ => return,
        }
        self.remove_link(peer);
    }

    fn remove_link(&mut self, peer: &NodeId) {
        if self.links.remove(peer).is_none() {
            return;
        }
        info!(node = %self.node_id, peer = %peer, "link down");
        self.advertise_self();
        self.recompute();
        self.publish();
    }

    /// Bring a late joiner up to date: replay every origin's latest
    /// stored update and every live directory advert onto one link.
    fn replay_state_to(&self, peer: &NodeId) {
        let Some(link) = self.links.get(peer) else {
            return;
        };
        for (origin, edges) in &self.graph {
            if origin == peer {
                continue;
            }
            let update = Frame::RoutingUpdate(RoutingUpdate {
                origin: origin.clone(),
                generation: self.generations.get(origin).copied().unwrap_or(0),
                edges: edges.iter().map(|(n, c)| (n.clone(), *c)).collect(),
            });
            enqueue(&self.node_id, peer, link, &update);
        }
        let now = now_ms();
        for ((origin, service), info) in &self.directory {
            if info.expires_ms <= now {
                continue;
            }
            // Our own entries carry the local advert generation; remote
            // ones carry the highest generation seen for them.
            let generation = if origin == &self.node_id {
                self.local_services
                    .get(service)
                    .map(|(_, g)| *g)
                    .unwrap_or(0)
            } else {
                self.advert_gens
                    .get(&(origin.clone(), service.clone()))
                    .copied()
                    .unwrap_or(0)
            };
            let advert = Frame::ServiceAdvert(ServiceAdvert {
                origin: origin.clone(),
                generation,
                service: service.clone(),
                tags: info.tags.clone(),
                expires_ms: info.expires_ms,
            });
            enqueue(&self.node_id, peer, link, &advert);
        }
    }

    /// Flood our own neighbor list under a fresh generation.
    fn advertise_self(&mut self) {
        self.my_generation += 1;
        let update = Frame::RoutingUpdate(RoutingUpdate {
            origin: self.node_id.clone(),
            generation: self.my_generation,
            edges: self
                .links
                .iter()
                .map(|(peer, l)| (peer.clone(), l.negotiated))
                .collect(),
        });
        self.flood(&update, None);
    }

    fn flood(&self, frame: &Frame, except: Option<&NodeId>) {
        for (peer, link) in &self.links {
            if Some(peer) == except {
                continue;
            }
            enqueue(&self.node_id, peer, link, frame);
        }
    }

    // ------------------------------------------------------------------
    // Flooded adverts
    // ------------------------------------------------------------------

    fn on_advert(&mut self, via: NodeId, frame: Frame) {
        match frame {
            Frame::RoutingUpdate(update) => self.on_routing_update(via, update),
            Frame::ServiceAdvert(advert) => self.on_service_advert(via, advert),
            other => warn!(tag = other.tag(), "non-advert frame on the advert path"),
        }
    }

    fn on_routing_update(&mut self, via: NodeId, update: RoutingUpdate) {
        if update.origin == self.node_id {
            return;
        }
        let stored = self.generations.get(&update.origin).copied().unwrap_or(0);
        if update.generation <= stored {
            trace!(
                origin = %update.origin,
                generation = update.generation,
                stored,
                "stale routing update dropped"
            );
            return;
        }
        self.generations
            .insert(update.origin.clone(), update.generation);
        self.graph.insert(
            update.origin.clone(),
            update.edges.iter().cloned().collect(),
        );
        debug!(
            node = %self.node_id,
            origin = %update.origin,
            generation = update.generation,
            edges = update.edges.len(),
            "routing update applied"
        );
        self.recompute();
        self.publish();
        self.flood(&Frame::RoutingUpdate(update), Some(&via));
    }

    fn on_service_advert(&mut self, via: NodeId, advert: ServiceAdvert) {
        if advert.origin == self.node_id {
            return;
        }
        let key = (advert.origin.clone(), advert.service.clone());
        let stored = self.advert_gens.get(&key).copied().unwrap_or(0);
        if advert.generation <= stored {
            return;
        }
        self.advert_gens.insert(key.clone(), advert.generation);
        if advert.expires_ms <= now_ms() {
            self.directory.remove(&key);
        } else {
            self.directory.insert(
                key,
                ServiceInfo {
                    tags: advert.tags.clone(),
                    expires_ms: advert.expires_ms,
                },
            );
        }
        self.publish();
        self.flood(&Frame::ServiceAdvert(advert), Some(&via));
    }

    // ------------------------------------------------------------------
    // Local services
    // ------------------------------------------------------------------

    fn advertise_service(&mut self, service: String, tags: BTreeMap<String, String>) {
        let generation = self
            .local_services
            .get(&service)
            .map(|(_, g)| g + 1)
            .unwrap_or_else(now_ms);
        self.local_services
            .insert(service.clone(), (tags.clone(), generation));
        let expires_ms = now_ms() + ADVERT_LIFETIME.as_millis() as u64;
        self.directory.insert(
            (self.node_id.clone(), service.clone()),
            ServiceInfo {
                tags: tags.clone(),
                expires_ms,
            },
        );
        self.flood(
            &Frame::ServiceAdvert(ServiceAdvert {
                origin: self.node_id.clone(),
                generation,
                service,
                tags,
                expires_ms,
            }),
            None,
        );
        self.publish();
    }

    fn withdraw_service(&mut self, service: &str) {
        let Some((tags, generation)) = self.local_services.remove(service) else {
            return;
        };
        self.directory
            .remove(&(self.node_id.clone(), service.to_string()));
        self.flood(
            &Frame::ServiceAdvert(ServiceAdvert {
                origin: self.node_id.clone(),
                generation: generation + 1,
                service: service.to_string(),
                tags,
                expires_ms: 0,
            }),
            None,
        );
        self.publish();
    }

    /// Periodic re-flood of our own state plus directory expiry sweep.
    fn refresh(&mut self) {
        if !self.links.is_empty() {
            self.advertise_self();
            let services: Vec<String> = self.local_services.keys().cloned().collect();
            for service in services {
                let (tags, _) = self.local_services.get(&service).cloned().unwrap_or_default();
                self.advertise_service(service, tags);
            }
        }
        let now = now_ms();
        let before = self.directory.len();
        self.directory.retain(|_, info| info.expires_ms > now);
        if self.directory.len() != before {
            self.publish();
        }
    }

    // ------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------

    fn forward(&mut self, mut frame: DataFrame) {
        if frame.dst_node == self.node_id {
            match self.registry.dispatch(frame.clone()) {
                DispatchOutcome::Delivered | DispatchOutcome::Shed => {}
                DispatchOutcome::NoSuchService => {
                    self.report_undeliverable(&frame, "no such service");
                }
            }
            return;
        }
        if frame.ttl == 0 {
            debug!(dst = %frame.dst_node, "hop limit exhausted, dropping frame");
            self.report_undeliverable(&frame, "hop limit exceeded");
            return;
        }
        frame.ttl -= 1;

        // One retry if the chosen link died between lookup and send.
        for _ in 0..2 {
            let Some(route) = self.routes.get(&frame.dst_node).cloned() else {
                self.report_undeliverable(&frame, "no route to node");
                return;
            };
            let Some(link) = self.links.get(&route.next_hop) else {
                // Table is momentarily ahead of the link set; repair it.
                self.recompute();
                self.publish();
                continue;
            };
            let encoded = match Frame::Data(frame.clone()).encode() {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "dropping unencodable frame");
                    return;
                }
            };
            match link.queue.try_send(encoded) {
                Ok(()) => {
                    trace!(
                        dst = %frame.dst_node,
                        next_hop = %route.next_hop,
                        ttl = frame.ttl,
                        "frame forwarded"
                    );
                    return;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(next_hop = %route.next_hop, "link send queue full, shedding frame");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The link task is gone but LinkDown has not been
                    // processed yet. Drop it now and retry once.
                    self.remove_link(&route.next_hop.clone());
                }
            }
        }
        self.report_undeliverable(&frame, "no route to node");
    }

    /// Route an unreachable notice toward its destination. Notices are
    /// best-effort, burn one hop of their budget per forward exactly
    /// like data frames, and never themselves generate notices — a
    /// notice that cannot be delivered or runs out of hops just dies.
    fn forward_notice(&mut self, mut info: UnreachableInfo) {
        if info.dst_node == self.node_id {
            self.registry.notify_unreachable(
                &info.dst_service.clone(),
                UnreachableNotice {
                    problem_node: info.problem_node,
                    problem_service: info.problem_service,
                    reason: info.reason,
                },
            );
            return;
        }
        if info.ttl == 0 {
            debug!(dst = %info.dst_node, "hop limit exhausted, dropping notice");
            return;
        }
        info.ttl -= 1;
        let Some(route) = self.routes.get(&info.dst_node) else {
            return;
        };
        let Some(link) = self.links.get(&route.next_hop) else {
            return;
        };
        if let Ok(encoded) = Frame::Unreachable(info).encode() {
            let _ = link.queue.try_send(encoded);
        }
    }

    /// A data frame could not be delivered: tell its source.
    fn report_undeliverable(&mut self, frame: &DataFrame, reason: &str) {
        debug!(
            src = %frame.src_node,
            dst = %frame.dst_node,
            service = %frame.dst_service,
            reason,
            "frame undeliverable"
        );
        let notice = UnreachableInfo {
            dst_node: frame.src_node.clone(),
            dst_service: frame.src_service.clone(),
            problem_node: frame.dst_node.clone(),
            problem_service: frame.dst_service.clone(),
            ttl: DEFAULT_TTL,
            reason: reason.to_string(),
        };
        self.forward_notice(notice);
    }

    // ------------------------------------------------------------------
    // Costs, status, recomputation
    // ------------------------------------------------------------------

    fn set_backend_cost(
        &mut self,
        backend: usize,
        cost: f64,
        node_costs: &HashMap<NodeId, f64>,
    ) -> usize {
        let mut changed = 0;
        for (peer, link) in self.links.iter_mut() {
            if link.backend != backend {
                continue;
            }
            let effective = node_costs
                .get(peer)
                .copied()
                .unwrap_or_else(|| cost.max(link.remote_suggest));
            if effective.total_cmp(&link.negotiated) != std::cmp::Ordering::Equal {
                link.negotiated = effective;
                changed += 1;
            }
        }
        if changed > 0 {
            info!(backend, cost, changed, "link costs updated");
            self.advertise_self();
            self.recompute();
            self.publish();
        }
        changed
    }

    fn status(&self) -> EngineStatus {
        let mut up_links: Vec<(NodeId, f64)> = self
            .links
            .iter()
            .map(|(p, l)| (p.clone(), l.negotiated))
            .collect();
        up_links.sort_by(|a, b| a.0.cmp(&b.0));
        let mut routes: Vec<(NodeId, Route)> = self
            .routes
            .iter()
            .map(|(d, r)| (d.clone(), r.clone()))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        let mut services: Vec<(NodeId, String)> =
            self.directory.keys().cloned().collect();
        services.sort();
        EngineStatus {
            node_id: self.node_id.clone(),
            generation: self.my_generation,
            up_links,
            routes,
            services,
        }
    }

    fn recompute(&mut self) {
        self.routes = shortest_paths(&self.node_id, &self.links, &self.graph);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Arc::new(RoutingSnapshot {
            routes: self.routes.clone(),
            services: self.directory.clone(),
        }));
    }
}

fn enqueue(node: &NodeId, peer: &NodeId, link: &LinkHandle, frame: &Frame) {
    let encoded = match frame.encode() {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "dropping unencodable frame");
            return;
        }
    };
    if link.queue.try_send(encoded).is_err() {
        debug!(node = %node, peer = %peer, tag = frame.tag(), "link queue unavailable, frame dropped");
    }
}

// ----------------------------------------------------------------------------
// Shortest paths
// ----------------------------------------------------------------------------

/// Heap entry ordered so the smallest cost pops first, with ties broken
/// by lexicographic first hop and then destination, which makes route
/// selection deterministic.
#[derive(PartialEq)]
struct HeapEntry {
    cost: f64,
    first_hop: Option<NodeId>,
    node: NodeId,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap and we want the min.
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.first_hop.cmp(&self.first_hop))
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Dijkstra over the flooded connection graph.
///
/// Edges incident to ourselves come exclusively from the live link set,
/// so no table entry can name a next hop that is not an up link. A
/// remote edge counts only when *both* endpoints' latest updates list
/// each other (weight: max of the two directions); a crashed node's
/// stale self-advertisement therefore stops carrying traffic as soon as
/// any of its former neighbors re-floods without it.
fn shortest_paths(
    self_id: &NodeId,
    links: &HashMap<NodeId, LinkHandle>,
    graph: &HashMap<NodeId, HashMap<NodeId, f64>>,
) -> HashMap<NodeId, Route> {
    let mut adjacency: HashMap<NodeId, HashMap<NodeId, f64>> = HashMap::new();
    let mut add_edge = |a: &NodeId, b: &NodeId, cost: f64| {
        for (from, to) in [(a, b), (b, a)] {
            let slot = adjacency
                .entry(from.clone())
                .or_default()
                .entry(to.clone())
                .or_insert(cost);
            if cost > *slot {
                *slot = cost;
            }
        }
    };

    for (peer, link) in links {
        // The peer may have re-costed its side since the handshake;
        // the effective weight stays the max of the two views.
        let advertised_back = graph
            .get(peer)
            .and_then(|edges| edges.get(self_id))
            .copied()
            .unwrap_or(0.0);
        add_edge(self_id, peer, link.negotiated.max(advertised_back));
    }
    for (origin, edges) in graph {
        if origin == self_id {
            continue;
        }
        for (neighbor, cost) in edges {
            if origin == neighbor || neighbor == self_id {
                continue;
            }
            let Some(back) = graph.get(neighbor).and_then(|e| e.get(origin)) else {
                continue;
            };
            add_edge(origin, neighbor, cost.max(*back));
        }
    }

    let mut best: HashMap<NodeId, (f64, Option<NodeId>)> = HashMap::new();
    let mut heap = BinaryHeap::new();
    best.insert(self_id.clone(), (0.0, None));
    heap.push(HeapEntry {
        cost: 0.0,
        first_hop: None,
        node: self_id.clone(),
    });

    while let Some(HeapEntry { cost, first_hop, node }) = heap.pop() {
        match best.get(&node) {
            Some((c, h)) if settled_beats(*c, h, cost, &first_hop) => continue,
            _ => {}
        }
        let Some(neighbors) = adjacency.get(&node) else {
            continue;
        };
        for (neighbor, weight) in neighbors {
            let next_cost = cost + weight;
            let next_hop = first_hop.clone().or_else(|| Some(neighbor.clone()));
            let improves = match best.get(neighbor) {
                None => true,
                Some((c, h)) => match next_cost.total_cmp(c) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => next_hop < *h,
                    std::cmp::Ordering::Greater => false,
                },
            };
            if improves {
                best.insert(neighbor.clone(), (next_cost, next_hop.clone()));
                heap.push(HeapEntry {
                    cost: next_cost,
                    first_hop: next_hop,
                    node: neighbor.clone(),
                });
            }
        }
    }

    best.into_iter()
        .filter(|(node, _)| node != self_id)
        .filter_map(|(node, (cost, hop))| {
            hop.map(|next_hop| (node, Route { next_hop, cost }))
        })
        .collect()
}

/// True when the already-settled (cost, hop) strictly beats a popped
/// heap entry, meaning the entry is stale.
fn settled_beats(
    settled_cost: f64,
    settled_hop: &Option<NodeId>,
    cost: f64,
    hop: &Option<NodeId>,
) -> bool {
    match settled_cost.total_cmp(&cost) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Equal => settled_hop < hop,
        std::cmp::Ordering::Greater => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    struct TestLink {
        rx: mpsc::Receiver<Vec<u8>>,
    }

    impl TestLink {
        /// Drain everything currently queued, decoded.
        fn drain(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Ok(bytes) = self.rx.try_recv() {
                frames.push(Frame::decode(&bytes).unwrap());
            }
            frames
        }
    }

    struct Harness {
        handle: EngineHandle,
        shutdown: Shutdown,
        registry: Arc<ServiceRegistry>,
    }

    impl Harness {
        fn new(id: &str) -> Self {
            let registry = Arc::new(ServiceRegistry::new());
            let shutdown = Shutdown::new();
            let handle = spawn_engine(node(id), registry.clone(), shutdown.clone());
            Harness {
                handle,
                shutdown,
                registry,
            }
        }

        async fn link_up(&self, peer: &str, cost: f64) -> TestLink {
            let (tx, rx) = mpsc::channel(LINK_SEND_QUEUE);
            self.handle
                .send(EngineCmd::LinkUp {
                    peer: node(peer),
                    link_id: 1,
                    backend: 0,
                    negotiated: cost,
                    remote_suggest: cost,
                    queue: tx,
                })
                .await;
            TestLink { rx }
        }

        async fn inject_update(&self, via: &str, origin: &str, generation: u64, edges: &[(&str, f64)]) {
            self.handle
                .send(EngineCmd::Advert {
                    via: node(via),
                    frame: Frame::RoutingUpdate(RoutingUpdate {
                        origin: node(origin),
                        generation,
                        edges: edges.iter().map(|(n, c)| (node(n), *c)).collect(),
                    }),
                })
                .await;
        }

        /// Status round-trip doubles as a barrier: all previously sent
        /// commands have been processed once it returns.
        async fn sync(&self) -> EngineStatus {
            self.handle.status().await.unwrap()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    #[tokio::test]
    async fn link_up_floods_update_with_fresh_generation() {
        let h = Harness::new("a");
        let base = h.sync().await.generation;
        let mut link = h.link_up("b", 1.0).await;
        let status = h.sync().await;
        assert!(status.generation > base);
        let frames = link.drain();
        let update = frames
            .iter()
            .find_map(|f| match f {
                Frame::RoutingUpdate(u) => Some(u),
                _ => None,
            })
            .expect("routing update flooded on link up");
        assert_eq!(update.origin, node("a"));
        assert_eq!(update.generation, status.generation);
        assert_eq!(update.edges, vec![(node("b"), 1.0)]);
    }

    #[tokio::test]
    async fn triangle_prefers_cheap_two_hop_path() {
        let h = Harness::new("a");
        let _b = h.link_up("b", 1.0).await;
        let _c = h.link_up("c", 5.0).await;
        h.inject_update("b", "b", 1, &[("a", 1.0), ("c", 1.0)]).await;
        h.inject_update("c", "c", 1, &[("a", 5.0), ("b", 1.0)]).await;
        h.sync().await;

        let snap = h.handle.snapshot();
        let to_c = snap.route_to(&node("c")).expect("route to c");
        assert_eq!(to_c.next_hop, node("b"));
        assert_eq!(to_c.cost, 2.0);

        // Severing a-b falls back to the direct expensive link.
        h.handle.send(EngineCmd::LinkDown { peer: node("b"), link_id: 1 }).await;
        h.sync().await;
        let snap = h.handle.snapshot();
        let to_c = snap.route_to(&node("c")).expect("route to c survives");
        assert_eq!(to_c.next_hop, node("c"));
        assert_eq!(to_c.cost, 5.0);
    }

    #[tokio::test]
    async fn stale_generation_is_dropped_and_duplicate_is_idempotent() {
        let h = Harness::new("a");
        let _b = h.link_up("b", 1.0).await;
        h.inject_update("b", "b", 3, &[("a", 1.0), ("c", 1.0)]).await;
        h.inject_update("b", "c", 1, &[("b", 1.0)]).await;
        h.sync().await;
        let after_first = h.handle.snapshot();

        // Same update again: same table. Older generation: ignored.
        h.inject_update("b", "b", 3, &[("a", 1.0), ("c", 1.0)]).await;
        h.inject_update("b", "b", 2, &[("a", 1.0)]).await;
        h.sync().await;
        let after_replays = h.handle.snapshot();
        assert_eq!(after_first.routes, after_replays.routes);
        assert!(after_replays.route_to(&node("c")).is_some());
    }

    #[tokio::test]
    async fn equal_cost_routes_pick_lexicographic_next_hop() {
        let h = Harness::new("a");
        let _m = h.link_up("m", 1.0).await;
        let _z = h.link_up("z", 1.0).await;
        // Both m and z reach d for the same total cost.
        h.inject_update("m", "m", 1, &[("a", 1.0), ("d", 1.0)]).await;
        h.inject_update("z", "z", 1, &[("a", 1.0), ("d", 1.0)]).await;
        h.inject_update("m", "d", 1, &[("m", 1.0), ("z", 1.0)]).await;
        h.sync().await;
        let snap = h.handle.snapshot();
        let to_d = snap.route_to(&node("d")).expect("route to d");
        assert_eq!(to_d.cost, 2.0);
        assert_eq!(to_d.next_hop, node("m"), "ties resolve to the lexicographically smaller hop");
    }

    #[tokio::test]
    async fn forwarded_frames_have_strictly_smaller_ttl() {
        let h = Harness::new("a");
        let mut b = h.link_up("b", 1.0).await;
        h.inject_update("b", "b", 1, &[("a", 1.0), ("c", 1.0)]).await;
        h.inject_update("b", "c", 1, &[("b", 1.0)]).await;
        h.sync().await;
        b.drain();

        h.handle
            .send(EngineCmd::Inbound {
                frame: Frame::Data(DataFrame {
                    src_node: node("x"),
                    dst_node: node("c"),
                    src_service: "cli".into(),
                    dst_service: "echo".into(),
                    ttl: 7,
                    payload: b"fwd".to_vec(),
                }),
            })
            .await;
        h.sync().await;
        let forwarded = b
            .drain()
            .into_iter()
            .find_map(|f| match f {
                Frame::Data(d) => Some(d),
                _ => None,
            })
            .expect("frame forwarded to next hop");
        assert_eq!(forwarded.ttl, 6);
    }

    #[tokio::test]
    async fn exhausted_ttl_generates_unreachable_notice() {
        let h = Harness::new("a");
        let mut b = h.link_up("b", 1.0).await;
        h.inject_update("b", "b", 1, &[("a", 1.0), ("c", 1.0), ("x", 1.0)]).await;
        h.inject_update("b", "c", 1, &[("b", 1.0)]).await;
        h.inject_update("b", "x", 1, &[("b", 1.0)]).await;
        h.sync().await;
        b.drain();

        h.handle
            .send(EngineCmd::Inbound {
                frame: Frame::Data(DataFrame {
                    src_node: node("x"),
                    dst_node: node("c"),
                    src_service: "cli".into(),
                    dst_service: "echo".into(),
                    ttl: 0,
                    payload: vec![],
                }),
            })
            .await;
        h.sync().await;
        let notice = b
            .drain()
            .into_iter()
            .find_map(|f| match f {
                Frame::Unreachable(u) => Some(u),
                _ => None,
            })
            .expect("unreachable notice routed back");
        assert_eq!(notice.dst_node, node("x"));
        assert_eq!(notice.problem_node, node("c"));
        assert_eq!(notice.ttl, DEFAULT_TTL - 1, "forwarding burns one hop");
    }

    #[tokio::test]
    async fn exhausted_notice_is_dropped_silently() {
        let h = Harness::new("a");
        let mut b = h.link_up("b", 1.0).await;
        h.inject_update("b", "b", 1, &[("a", 1.0), ("x", 1.0)]).await;
        h.inject_update("b", "x", 1, &[("b", 1.0)]).await;
        h.sync().await;
        b.drain();

        h.handle
            .send(EngineCmd::Inbound {
                frame: Frame::Unreachable(UnreachableInfo {
                    dst_node: node("x"),
                    dst_service: "cli".into(),
                    problem_node: node("c"),
                    problem_service: "echo".into(),
                    ttl: 0,
                    reason: "no route to node".into(),
                }),
            })
            .await;
        h.sync().await;
        assert!(
            b.drain().is_empty(),
            "a notice out of hops must die without a successor"
        );
    }

    #[tokio::test]
    async fn no_route_delivers_local_notice_to_source_service() {
        let h = Harness::new("a");
        let mut rx = h.registry.bind("cli").unwrap();
        h.handle
            .send_data(DataFrame {
                src_node: node("a"),
                dst_node: node("ghost"),
                src_service: "cli".into(),
                dst_service: "echo".into(),
                ttl: 10,
                payload: vec![],
            })
            .await;
        h.sync().await;
        match rx.try_recv() {
            Ok(crate::services::Delivery::Unreachable(n)) => {
                assert_eq!(n.problem_node, node("ghost"));
            }
            other => panic!("expected unreachable notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn next_hop_is_always_an_up_link() {
        let h = Harness::new("a");
        let _b = h.link_up("b", 1.0).await;
        h.inject_update("b", "b", 1, &[("a", 1.0), ("c", 1.0)]).await;
        h.inject_update("b", "c", 1, &[("b", 1.0)]).await;
        h.sync().await;
        assert!(h.handle.snapshot().route_to(&node("c")).is_some());

        h.handle.send(EngineCmd::LinkDown { peer: node("b"), link_id: 1 }).await;
        let status = h.sync().await;
        assert!(status.routes.is_empty(), "routes must vanish with their next hop");
    }

    #[tokio::test]
    async fn backend_cost_change_bumps_generation_and_refloods() {
        let h = Harness::new("a");
        let mut b = h.link_up("b", 1.0).await;
        let before = h.sync().await.generation;
        b.drain();

        let changed = h
            .handle
            .set_backend_cost(0, 3.0, HashMap::new())
            .await
            .unwrap();
        assert_eq!(changed, 1);
        let status = h.sync().await;
        assert!(status.generation > before, "cost change must advance the generation");
        let update = b
            .drain()
            .into_iter()
            .find_map(|f| match f {
                Frame::RoutingUpdate(u) => Some(u),
                _ => None,
            })
            .expect("cost change refloods");
        assert_eq!(update.edges, vec![(node("b"), 3.0)]);
        assert_eq!(update.generation, status.generation);
    }

    #[tokio::test]
    async fn service_adverts_update_directory_and_withdraw_on_expiry() {
        let h = Harness::new("a");
        let _b = h.link_up("b", 1.0).await;
        h.handle
            .send(EngineCmd::Advert {
                via: node("b"),
                frame: Frame::ServiceAdvert(ServiceAdvert {
                    origin: node("b"),
                    generation: 1,
                    service: "echo".into(),
                    tags: BTreeMap::new(),
                    expires_ms: now_ms() + 60_000,
                }),
            })
            .await;
        h.sync().await;
        assert_eq!(h.handle.snapshot().providers_of("echo"), vec![node("b")]);

        h.handle
            .send(EngineCmd::Advert {
                via: node("b"),
                frame: Frame::ServiceAdvert(ServiceAdvert {
                    origin: node("b"),
                    generation: 2,
                    service: "echo".into(),
                    tags: BTreeMap::new(),
                    expires_ms: 0,
                }),
            })
            .await;
        h.sync().await;
        assert!(h.handle.snapshot().providers_of("echo").is_empty());
    }

    #[tokio::test]
    async fn new_link_receives_replayed_topology() {
        let h = Harness::new("a");
        let _b = h.link_up("b", 1.0).await;
        h.inject_update("b", "b", 1, &[("a", 1.0), ("c", 1.0)]).await;
        h.inject_update("b", "c", 4, &[("b", 1.0)]).await;
        h.sync().await;

        // d joins later and must learn about b and c immediately.
        let mut d = h.link_up("d", 1.0).await;
        h.sync().await;
        let origins: Vec<NodeId> = d
            .drain()
            .into_iter()
            .filter_map(|f| match f {
                Frame::RoutingUpdate(u) => Some(u.origin),
                _ => None,
            })
            .collect();
        assert!(origins.contains(&node("a")));
        assert!(origins.contains(&node("b")));
        assert!(origins.contains(&node("c")));
    }
}
