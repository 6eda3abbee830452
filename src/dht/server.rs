use super::bep44::{Ed25519Verifier, Item, Verifier};
use super::config::DhtConfig;
use super::error::{DhtError, KrpcError};
use super::lookup::{Lookup, LookupMode, LookupOutcome, QueryRpc};
use super::message::{Body, KrpcMessage, Query, Response, TransactionId};
use super::node::{is_valid_port, Contact, NodeId};
use super::routing::{Insertion, RoutingTable};
use super::storage::StorageEngine;
use super::token::TokenAuthority;
use super::transaction::{ReplySender, TransactionManager};
use crate::constants::{K, MAX_DATAGRAM_SIZE};
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications published by a running node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtEvent {
    Listening(SocketAddr),
    /// Bootstrap finished (or was disabled); the node can serve lookups.
    Ready,
    NodeDiscovered { id: NodeId, addr: SocketAddr },
    /// A lookup learned a peer for an info hash.
    PeerDiscovered { info_hash: NodeId, peer: SocketAddr },
    /// A peer was recorded for an info hash for the first time, either from
    /// an incoming `announce_peer` or through [`DhtServer::add_peer`].
    AnnounceReceived { info_hash: NodeId, peer: SocketAddr },
    /// A network fault that affected one message or transaction only.
    Warning(String),
    Error(String),
}

/// Options for [`DhtServer::lookup`].
#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub mode: LookupMode,
    /// Addresses to query before the routing table's closest contacts. All
    /// of them are asked, not only the first `alpha`.
    pub seeds: Vec<SocketAddr>,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            mode: LookupMode::FindNode,
            seeds: Vec::new(),
        }
    }
}

impl LookupOptions {
    pub fn mode(mode: LookupMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Per-node results of an `announce`. Reaching fewer than `K` nodes is
/// normal; the announce succeeded if at least one node accepted it.
#[derive(Debug)]
pub struct AnnounceOutcome {
    pub info_hash: NodeId,
    /// Peers learned while looking up the info hash.
    pub peers: Vec<SocketAddr>,
    pub announced: Vec<SocketAddr>,
    pub failures: Vec<(SocketAddr, DhtError)>,
}

impl AnnounceOutcome {
    pub fn is_success(&self) -> bool {
        !self.announced.is_empty()
    }
}

/// Per-node results of a `put`.
#[derive(Debug)]
pub struct PutOutcome {
    /// Key the item is stored under.
    pub key: NodeId,
    pub stored: Vec<SocketAddr>,
    pub failures: Vec<(SocketAddr, DhtError)>,
}

impl PutOutcome {
    pub fn is_success(&self) -> bool {
        !self.stored.is_empty()
    }
}

enum Command {
    Query {
        addr: SocketAddr,
        query: Query,
        reply: ReplySender,
    },
    Expire {
        addr: SocketAddr,
        tid: TransactionId,
    },
    AddContact(Contact),
    RemoveContact(NodeId, oneshot::Sender<bool>),
    Closest(NodeId, usize, oneshot::Sender<Vec<Contact>>),
    Snapshot(oneshot::Sender<Vec<Contact>>),
    Put(Item, oneshot::Sender<Result<NodeId, KrpcError>>),
    GetValue(NodeId, oneshot::Sender<Option<Item>>),
    Peers(NodeId, oneshot::Sender<Vec<SocketAddr>>),
    AddPeer(NodeId, SocketAddr, oneshot::Sender<bool>),
    RemovePeer(NodeId, SocketAddr, oneshot::Sender<bool>),
    RotateSecret,
    Shutdown(oneshot::Sender<()>),
}

struct Inner {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<DhtEvent>,
    /// Receiver created with the channel, handed to the first subscriber so
    /// events sent during `bind` are not lost.
    first_subscriber: Mutex<Option<broadcast::Receiver<DhtEvent>>>,
    our_id: NodeId,
    local_addr: SocketAddr,
    alpha: usize,
    bootstrap_nodes: Vec<String>,
    verifier: Arc<dyn Verifier>,
    ready: AtomicBool,
    destroyed: AtomicBool,
}

/// A DHT node ([BEP-5] with [BEP-44] storage).
///
/// `DhtServer` is a cheap, cloneable handle. All node state (routing table,
/// transactions, tokens, storage) lives in a single task that serializes
/// every mutation; handles talk to it over a channel.
///
/// # Examples
///
/// ```no_run
/// use rdht::dht::{DhtConfig, DhtServer, NodeId};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = DhtServer::bind(DhtConfig::default()).await?;
/// dht.bootstrap().await?;
///
/// let info_hash = NodeId([0u8; 20]);
/// let outcome = dht.announce(info_hash, 6881).await?;
/// println!("announced to {} nodes, {} peers known", outcome.announced.len(), outcome.peers.len());
///
/// dht.destroy().await?;
/// # Ok(())
/// # }
/// ```
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
/// [BEP-44]: http://bittorrent.org/beps/bep_0044.html
#[derive(Clone)]
pub struct DhtServer {
    inner: Arc<Inner>,
}

impl DhtServer {
    pub async fn bind(config: DhtConfig) -> Result<Self, DhtError> {
        Self::bind_with_verifier(config, Arc::new(Ed25519Verifier)).await
    }

    /// Binds with a custom signature verifier for BEP-44 mutable items.
    pub async fn bind_with_verifier(
        config: DhtConfig,
        verifier: Arc<dyn Verifier>,
    ) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let our_id = config.node_id.unwrap_or_else(NodeId::generate);

        info!("DHT server bound to {} with id {}", local_addr, our_id);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, first_subscriber) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut routing = RoutingTable::new(our_id);
        routing.set_local_addr(local_addr);

        let actor = DhtActor {
            socket,
            our_id,
            routing,
            tokens: TokenAuthority::new(),
            transactions: TransactionManager::new(),
            storage: StorageEngine::with_limits(&config.storage, verifier.clone()),
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
            events: events.clone(),
            query_timeout: config.query_timeout,
            secret_rotation: config.secret_rotation,
            max_pending_queries: config.max_pending_queries,
        };
        tokio::spawn(actor.run());

        let server = Self {
            inner: Arc::new(Inner {
                cmd_tx,
                events,
                first_subscriber: Mutex::new(Some(first_subscriber)),
                our_id,
                local_addr,
                alpha: config.alpha,
                bootstrap_nodes: config.bootstrap_nodes,
                verifier,
                ready: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        };
        server.emit(DhtEvent::Listening(local_addr));

        if config.bootstrap {
            let node = server.clone();
            tokio::spawn(async move {
                if let Err(e) = node.bootstrap().await {
                    warn!("DHT bootstrap failed: {}", e);
                    node.emit(DhtEvent::Error(format!("bootstrap failed: {}", e)));
                }
            });
        } else {
            server.mark_ready();
        }

        Ok(server)
    }

    pub fn id(&self) -> NodeId {
        self.inner.our_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Event stream of this node. The first subscriber also sees the
    /// `Listening` and `Ready` events emitted while binding.
    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.inner
            .first_subscriber
            .lock()
            .take()
            .unwrap_or_else(|| self.inner.events.subscribe())
    }

    fn emit(&self, event: DhtEvent) {
        let _ = self.inner.events.send(event);
    }

    fn mark_ready(&self) {
        if !self.inner.ready.swap(true, Ordering::AcqRel) {
            self.emit(DhtEvent::Ready);
        }
    }

    fn ensure_alive(&self) -> Result<(), DhtError> {
        if self.is_destroyed() {
            return Err(DhtError::Destroyed);
        }
        Ok(())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DhtError> {
        self.ensure_alive()?;
        let (tx, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(command(tx))
            .await
            .map_err(|_| DhtError::Destroyed)?;
        rx.await.map_err(|_| DhtError::Destroyed)
    }

    /// Resolves the configured bootstrap hosts and runs a lookup for our own
    /// id through them. Returns the routing table size afterwards.
    pub async fn bootstrap(&self) -> Result<usize, DhtError> {
        self.ensure_alive()?;
        info!("Starting DHT bootstrap");

        let mut seeds = Vec::new();
        for host in &self.inner.bootstrap_nodes {
            match tokio::net::lookup_host(host.as_str()).await {
                Ok(addrs) => seeds.extend(addrs.filter(|a| a.is_ipv4())),
                Err(e) => warn!("Failed to resolve bootstrap node {}: {}", host, e),
            }
        }

        let options = LookupOptions {
            mode: LookupMode::FindNode,
            seeds,
        };
        self.lookup(self.id(), options).await?;

        let count = self.node_count().await?;
        info!("DHT bootstrap complete, {} nodes in routing table", count);
        self.mark_ready();
        Ok(count)
    }

    /// Sends a single query and waits for its response.
    pub async fn query(&self, addr: SocketAddr, query: Query) -> Result<Response, DhtError> {
        self.ensure_alive()?;
        QueryRpc::query(self, addr, query).await
    }

    /// Pings `addr` and returns the id it answered with.
    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        Ok(self.query(addr, Query::Ping).await?.id)
    }

    /// Adds a node to the routing table. Without an id the node is pinged
    /// first and added once it answers.
    pub async fn add_node(
        &self,
        addr: SocketAddr,
        id: Option<NodeId>,
    ) -> Result<NodeId, DhtError> {
        self.ensure_alive()?;
        if !is_valid_port(addr.port()) {
            return Err(DhtError::Validation(format!("invalid node address {}", addr)));
        }

        match id {
            Some(id) => {
                self.inner
                    .cmd_tx
                    .send(Command::AddContact(Contact::new(id, addr)))
                    .await
                    .map_err(|_| DhtError::Destroyed)?;
                Ok(id)
            }
            None => self.ping(addr).await,
        }
    }

    pub async fn remove_node(&self, id: NodeId) -> Result<bool, DhtError> {
        self.request(|tx| Command::RemoveContact(id, tx)).await
    }

    /// Snapshot of the routing table.
    pub async fn nodes(&self) -> Result<Vec<Contact>, DhtError> {
        self.request(Command::Snapshot).await
    }

    pub async fn node_count(&self) -> Result<usize, DhtError> {
        Ok(self.nodes().await?.len())
    }

    /// Contacts in the routing table closest to `target`.
    pub async fn closest(&self, target: NodeId, count: usize) -> Result<Vec<Contact>, DhtError> {
        self.request(|tx| Command::Closest(target, count, tx)).await
    }

    /// Iterative lookup of `target`.
    ///
    /// Locally stored peers (for `GetPeers`) and items (for `Get`) are
    /// reported together with whatever the network returns.
    pub async fn lookup(
        &self,
        target: NodeId,
        options: LookupOptions,
    ) -> Result<LookupOutcome, DhtError> {
        self.ensure_alive()?;
        let seeds = self.closest(target, K).await?;
        let lookup = Lookup::new(target, options.mode, self.inner.verifier.clone())
            .alpha(self.inner.alpha)
            .seed_contacts(seeds)
            .seed_addrs(options.seeds);

        match options.mode {
            LookupMode::FindNode => self.run_lookup(lookup).await,
            LookupMode::GetPeers => {
                let local = self.local_peers(target).await?;
                let mut outcome = self.run_lookup(lookup).await?;
                let mut known: HashSet<SocketAddr> = outcome.peers.iter().copied().collect();
                let mut peers: Vec<SocketAddr> =
                    local.into_iter().filter(|p| known.insert(*p)).collect();
                peers.append(&mut outcome.peers);
                outcome.peers = peers;
                Ok(outcome)
            }
            LookupMode::Get => {
                let local = self.request(|tx| Command::GetValue(target, tx)).await?;
                match self.run_lookup(lookup).await {
                    Err(e @ (DhtError::NotFound | DhtError::Verification(_))) => match local {
                        Some(value) => Ok(LookupOutcome {
                            target,
                            closest: Vec::new(),
                            peers: Vec::new(),
                            value: Some(value),
                            queried: 0,
                        }),
                        None => Err(e),
                    },
                    result => result,
                }
            }
        }
    }

    async fn run_lookup(&self, lookup: Lookup) -> Result<LookupOutcome, DhtError> {
        let outcome = lookup.run(self).await?;
        for peer in &outcome.peers {
            self.emit(DhtEvent::PeerDiscovered {
                info_hash: outcome.target,
                peer: *peer,
            });
        }
        debug!(
            "Lookup for {} queried {} nodes, {} closest, {} peers",
            outcome.target,
            outcome.queried,
            outcome.closest.len(),
            outcome.peers.len()
        );
        Ok(outcome)
    }

    /// The `K` closest nodes to `target` on the network.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Contact>, DhtError> {
        Ok(self.lookup(target, LookupOptions::default()).await?.closest)
    }

    /// Peers announced for `info_hash`, local and remote.
    pub async fn get_peers(&self, info_hash: NodeId) -> Result<Vec<SocketAddr>, DhtError> {
        let outcome = self
            .lookup(info_hash, LookupOptions::mode(LookupMode::GetPeers))
            .await?;
        info!(
            "DHT get_peers found {} peers after querying {} nodes",
            outcome.peers.len(),
            outcome.queried
        );
        Ok(outcome.peers)
    }

    /// Announces that we serve `info_hash` on `port` to the closest nodes
    /// that gave us a token. Port 0 asks them to use our source port.
    pub async fn announce(&self, info_hash: NodeId, port: u16) -> Result<AnnounceOutcome, DhtError> {
        let outcome = self
            .lookup(info_hash, LookupOptions::mode(LookupMode::GetPeers))
            .await?;

        let sends = outcome.closest.iter().filter_map(|contact| {
            let token = contact.token.clone()?;
            let query = Query::AnnouncePeer {
                info_hash,
                port,
                implied_port: port == 0,
                token,
            };
            let addr = contact.addr;
            Some(async move { (addr, self.query(addr, query).await) })
        });
        let results = futures::future::join_all(sends).await;

        let mut announced = Vec::new();
        let mut failures = Vec::new();
        for (addr, result) in results {
            match result {
                Ok(_) => announced.push(addr),
                Err(e) => {
                    debug!("announce_peer to {} failed: {}", addr, e);
                    failures.push((addr, e));
                }
            }
        }

        info!(
            "Announced {} to {} nodes ({} failed)",
            info_hash,
            announced.len(),
            failures.len()
        );

        Ok(AnnounceOutcome {
            info_hash,
            peers: outcome.peers,
            announced,
            failures,
        })
    }

    /// Stores a BEP-44 item locally and on the closest nodes that gave us a
    /// write token. Fails if the item does not pass local validation.
    pub async fn put(&self, item: Item) -> Result<PutOutcome, DhtError> {
        let key = self
            .request(|tx| Command::Put(item.clone(), tx))
            .await?
            .map_err(DhtError::Rejected)?;

        let seeds = self.closest(key, K).await?;
        let lookup = Lookup::new(key, LookupMode::Get, self.inner.verifier.clone())
            .alpha(self.inner.alpha)
            .stop_on_value(false)
            .seed_contacts(seeds);
        let outcome = self.run_lookup(lookup).await?;

        let sends = outcome.closest.iter().filter_map(|contact| {
            let query = Query::Put {
                token: contact.token.clone()?,
                item: item.clone(),
            };
            let addr = contact.addr;
            Some(async move { (addr, self.query(addr, query).await) })
        });
        let results = futures::future::join_all(sends).await;

        let mut stored = Vec::new();
        let mut failures = Vec::new();
        for (addr, result) in results {
            match result {
                Ok(_) => stored.push(addr),
                Err(e) => {
                    debug!("put to {} failed: {}", addr, e);
                    failures.push((addr, e));
                }
            }
        }

        Ok(PutOutcome {
            key,
            stored,
            failures,
        })
    }

    /// Returns the item stored under `key`, from the local store when
    /// present and from the network otherwise.
    pub async fn get(&self, key: NodeId) -> Result<Item, DhtError> {
        if let Some(item) = self.request(|tx| Command::GetValue(key, tx)).await? {
            return Ok(item);
        }

        self.lookup(key, LookupOptions::mode(LookupMode::Get))
            .await?
            .value
            .ok_or(DhtError::NotFound)
    }

    /// Peers stored locally for `info_hash`.
    pub async fn local_peers(&self, info_hash: NodeId) -> Result<Vec<SocketAddr>, DhtError> {
        self.request(|tx| Command::Peers(info_hash, tx)).await
    }

    pub async fn add_peer(&self, info_hash: NodeId, peer: SocketAddr) -> Result<bool, DhtError> {
        self.request(|tx| Command::AddPeer(info_hash, peer, tx)).await
    }

    pub async fn remove_peer(&self, info_hash: NodeId, peer: SocketAddr) -> Result<bool, DhtError> {
        self.request(|tx| Command::RemovePeer(info_hash, peer, tx)).await
    }

    /// Rotates the token secret now instead of waiting for the timer.
    pub async fn rotate_token_secret(&self) -> Result<(), DhtError> {
        self.ensure_alive()?;
        self.inner
            .cmd_tx
            .send(Command::RotateSecret)
            .await
            .map_err(|_| DhtError::Destroyed)
    }

    /// Stops the node: cancels every pending transaction and timer and
    /// closes the socket. Every later call fails with `Destroyed`.
    pub async fn destroy(&self) -> Result<(), DhtError> {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Err(DhtError::Destroyed);
        }

        let (tx, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        info!("DHT node {} destroyed", self.inner.our_id);
        Ok(())
    }
}

impl QueryRpc for DhtServer {
    fn our_id(&self) -> NodeId {
        self.inner.our_id
    }

    fn query(&self, addr: SocketAddr, query: Query) -> BoxFuture<'static, Result<Response, DhtError>> {
        let cmd_tx = self.inner.cmd_tx.clone();
        let destroyed = self.is_destroyed();
        Box::pin(async move {
            if destroyed {
                return Err(DhtError::Destroyed);
            }
            let (tx, rx) = oneshot::channel();
            cmd_tx
                .send(Command::Query {
                    addr,
                    query,
                    reply: tx,
                })
                .await
                .map_err(|_| DhtError::Destroyed)?;
            rx.await.map_err(|_| DhtError::Destroyed)?
        })
    }
}

/// Owner of all node state. Runs until shut down or until every handle is
/// dropped.
struct DhtActor {
    socket: UdpSocket,
    our_id: NodeId,
    routing: RoutingTable,
    tokens: TokenAuthority,
    transactions: TransactionManager,
    storage: StorageEngine,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::WeakSender<Command>,
    events: broadcast::Sender<DhtEvent>,
    query_timeout: Duration,
    secret_rotation: Duration,
    max_pending_queries: usize,
}

impl DhtActor {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut rotation = interval_at(Instant::now() + self.secret_rotation, self.secret_rotation);
        rotation.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, addr)) => self.handle_datagram(&buf[..n], addr).await,
                        Err(e) => {
                            // ICMP errors from earlier sends surface here on some platforms.
                            debug!("DHT socket receive error: {}", e);
                            self.emit(DhtEvent::Error(format!("socket error: {}", e)));
                        }
                    }
                }
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(Command::Shutdown(done)) => {
                            self.transactions.cancel_all();
                            let _ = done.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.transactions.cancel_all();
                            break;
                        }
                    }
                }
                _ = rotation.tick() => {
                    self.tokens.rotate();
                    debug!("DHT token secret rotated");
                }
            }
        }

        debug!("DHT actor for {} stopped", self.our_id);
    }

    fn emit(&self, event: DhtEvent) {
        let _ = self.events.send(event);
    }

    fn warn(&self, message: String) {
        warn!("{}", message);
        self.emit(DhtEvent::Warning(message));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Query { addr, query, reply } => self.start_query(addr, query, reply).await,
            Command::Expire { addr, tid } => {
                if self.transactions.expire(addr, tid) {
                    trace!("Query {} to {} timed out", tid, addr);
                }
            }
            Command::AddContact(contact) => self.observe(contact),
            Command::RemoveContact(id, reply) => {
                let _ = reply.send(self.routing.remove(&id).is_some());
            }
            Command::Closest(target, count, reply) => {
                let _ = reply.send(self.routing.closest(&target, count));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.routing.snapshot());
            }
            Command::Put(item, reply) => {
                let _ = reply.send(self.storage.put(&item));
            }
            Command::GetValue(key, reply) => {
                let _ = reply.send(self.storage.get(&key));
            }
            Command::Peers(info_hash, reply) => {
                let _ = reply.send(self.storage.peers(&info_hash));
            }
            Command::AddPeer(info_hash, peer, reply) => {
                let _ = reply.send(self.store_peer(info_hash, peer));
            }
            Command::RemovePeer(info_hash, peer, reply) => {
                let _ = reply.send(self.storage.remove_peer(&info_hash, &peer));
            }
            Command::RotateSecret => {
                self.tokens.rotate();
                debug!("DHT token secret rotated");
            }
            Command::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn start_query(&mut self, addr: SocketAddr, query: Query, reply: ReplySender) {
        if !is_valid_port(addr.port()) {
            trace!("Dropping query to invalid address {}", addr);
            let _ = reply.send(Err(DhtError::InvalidAddress(addr)));
            return;
        }

        if self.transactions.len() >= self.max_pending_queries {
            let _ = reply.send(Err(DhtError::RateLimited));
            return;
        }

        let tid = match self.transactions.begin(addr, reply) {
            Ok(tid) => tid,
            Err(reply) => {
                let _ = reply.send(Err(DhtError::RateLimited));
                return;
            }
        };

        let weak = self.cmd_tx.clone();
        let timeout = self.query_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::Expire { addr, tid }).await;
            }
        });
        self.transactions.arm(addr, tid, timer.abort_handle());

        trace!("Sending {} query {} to {}", query.method(), tid, addr);
        let data = KrpcMessage::query(tid, self.our_id, query).encode();
        if let Err(e) = self.socket.send_to(&data, addr).await {
            debug!("Failed to send query to {}: {}", addr, e);
            self.transactions.resolve(addr, tid, Err(DhtError::Io(e)));
        }
    }

    async fn send(&self, addr: SocketAddr, message: &KrpcMessage) {
        if !is_valid_port(addr.port()) {
            return;
        }
        if let Err(e) = self.socket.send_to(&message.encode(), addr).await {
            debug!("Failed to send reply to {}: {}", addr, e);
        }
    }

    /// Records a peer for `info_hash`, announcing it to subscribers the first
    /// time the address is seen.
    fn store_peer(&mut self, info_hash: NodeId, peer: SocketAddr) -> bool {
        let added = self.storage.add_peer(info_hash, peer);
        if added {
            debug!("Stored peer {} for info_hash {}", peer, info_hash);
            self.emit(DhtEvent::AnnounceReceived { info_hash, peer });
        }
        added
    }

    /// Adds a contact learned from the network to the routing table.
    fn observe(&mut self, contact: Contact) {
        if !is_valid_port(contact.addr.port()) {
            return;
        }
        let (id, addr) = (contact.id, contact.addr);
        if self.routing.add(contact) == Insertion::Added {
            trace!("Discovered node {} at {}", id, addr);
            self.emit(DhtEvent::NodeDiscovered { id, addr });
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr) {
        let KrpcMessage {
            transaction_id,
            body,
        } = match KrpcMessage::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Failed to parse DHT message from {}: {}", addr, e);
                return;
            }
        };

        match body {
            Body::Query { sender, query } => {
                self.handle_query(transaction_id, addr, sender, query).await
            }
            Body::InvalidQuery(error) => {
                self.warn(format!("Invalid query from {}: {}", addr, error));
                self.send(addr, &KrpcMessage::error(transaction_id, error))
                    .await;
            }
            Body::Response(response) => self.handle_response(transaction_id, addr, response),
            Body::Error(error) => {
                match self.pending_tid(&transaction_id, addr) {
                    Some(tid) => {
                        debug!("Error from {}: {}", addr, error);
                        self.transactions
                            .resolve(addr, tid, Err(DhtError::Remote(error)));
                    }
                    None => self.warn(format!("Unexpected error from {}: {}", addr, error)),
                }
            }
        }
    }

    fn pending_tid(&self, transaction_id: &Bytes, addr: SocketAddr) -> Option<TransactionId> {
        let bytes: [u8; 2] = transaction_id.as_ref().try_into().ok()?;
        let tid = u16::from_be_bytes(bytes);
        self.transactions.is_pending(addr, tid).then_some(tid)
    }

    fn handle_response(&mut self, transaction_id: Bytes, addr: SocketAddr, response: Response) {
        let Some(tid) = self.pending_tid(&transaction_id, addr) else {
            self.warn(format!("Unexpected response from {}", addr));
            return;
        };

        self.observe(Contact::new(response.id, addr));
        for node in response.nodes.iter().flatten() {
            if node.id != self.our_id {
                self.observe(Contact::new(node.id, node.addr));
            }
        }

        self.transactions.resolve(addr, tid, Ok(response));
    }

    async fn handle_query(
        &mut self,
        transaction_id: Bytes,
        addr: SocketAddr,
        sender: NodeId,
        query: Query,
    ) {
        trace!("Received {} query from {}", query.method(), addr);

        // Answered before the sender is recorded, so it never gets itself
        // back in `nodes`.
        let reply = match self.answer(addr, query) {
            Ok(response) => KrpcMessage::response(transaction_id, response),
            Err(error) => {
                debug!("Rejecting query from {}: {}", addr, error);
                KrpcMessage::error(transaction_id, error)
            }
        };
        self.observe(Contact::new(sender, addr));
        self.send(addr, &reply).await;
    }

    fn answer(&mut self, addr: SocketAddr, query: Query) -> Result<Response, KrpcError> {
        let mut response = Response::new(self.our_id);

        match query {
            Query::Ping => {}
            Query::FindNode { target } => {
                response.nodes = Some(self.routing.closest(&target, K));
            }
            Query::GetPeers { info_hash } => {
                response.token = Some(self.tokens.generate(addr.ip()));
                let peers = self.storage.peers(&info_hash);
                if peers.is_empty() {
                    response.nodes = Some(self.routing.closest(&info_hash, K));
                } else {
                    response.values = Some(peers);
                }
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                if !self.tokens.is_valid(&token, addr.ip()) {
                    debug!("Rejecting announce_peer from {} - invalid token", addr);
                    return Err(KrpcError::protocol("bad token"));
                }

                let port = if implied_port { addr.port() } else { port };
                if !is_valid_port(port) {
                    return Err(KrpcError::protocol("invalid port"));
                }

                self.store_peer(info_hash, SocketAddr::new(addr.ip(), port));
            }
            Query::Get { target, seq } => {
                response.token = Some(self.tokens.generate(addr.ip()));
                response.nodes = Some(self.routing.closest(&target, K));

                if let Some(item) = self.storage.get(&target) {
                    let stale = matches!((seq, item.seq), (Some(theirs), Some(ours)) if theirs >= ours);
                    if !stale {
                        response.item = Some(item);
                    }
                }
            }
            Query::Put { token, item } => {
                if !self.tokens.is_valid(&token, addr.ip()) {
                    debug!("Rejecting put from {} - invalid token", addr);
                    return Err(KrpcError::protocol("bad token"));
                }
                let key = self.storage.put(&item)?;
                debug!("Stored item {} from {}", key, addr);
            }
        }

        Ok(response)
    }
}
