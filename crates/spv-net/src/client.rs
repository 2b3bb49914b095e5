//! The client: connection pool management and the header-sync driver.
//!
//! All protocol state lives on one task. Connection tasks report through an
//! event channel; the client reacts, keeps the pool topped up to
//! `max_connections`, and drives exactly one `getheaders` flight at a time
//! against the chain tip.

use crate::connection::{wait_for, Connection, ConnectionConfig, PeerCommand, PeerEvent};
use crate::discovery;
use crate::message::{Inv, NetAddr};
use crate::peer::{Peer, PeerBook};
use crate::NetworkResult;
use rand::seq::SliceRandom;
use spv_chain::{Chain, Hash, InsertOutcome, Network, TipStore};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default target for simultaneous outbound connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// How long a header request may stay unanswered before it is re-dispatched.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(19);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Network to join.
    pub network: Network,
    /// Target outbound connection count.
    pub max_connections: usize,
    /// Header request timeout.
    pub header_timeout: Duration,
    /// Statically configured peers, dialed before DNS results arrive.
    pub known_peers: Vec<SocketAddr>,
    /// Per-connection configuration.
    pub connection: ConnectionConfig,
}

impl ClientConfig {
    /// Defaults for a network.
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            header_timeout: HEADER_TIMEOUT,
            known_peers: Vec::new(),
            connection: ConnectionConfig {
                magic: network.magic(),
                ..Default::default()
            },
        }
    }
}

struct PeerHandle {
    commands: mpsc::Sender<PeerCommand>,
    task: JoinHandle<()>,
    connected: bool,
    peer: Option<Peer>,
}

/// The SPV client.
pub struct Client {
    config: ClientConfig,
    chain: Chain,
    store: Option<Box<dyn TipStore>>,
    peer_book: PeerBook,
    connections: HashMap<SocketAddr, PeerHandle>,
    pending_inv: HashSet<Inv>,
    need_headers: bool,
    header_deadline: Option<Instant>,
    header_peer: Option<SocketAddr>,
    shutdown: bool,
    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: mpsc::Receiver<PeerEvent>,
    dns_task: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a client around an existing chain.
    ///
    /// The chain should already be seeded from the tip store when a
    /// persisted tip exists; the client only writes the store.
    pub fn new(config: ClientConfig, chain: Chain, store: Option<Box<dyn TipStore>>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            config,
            chain,
            store,
            peer_book: PeerBook::new(),
            connections: HashMap::new(),
            pending_inv: HashSet::new(),
            need_headers: true,
            header_deadline: None,
            header_peer: None,
            shutdown: false,
            event_tx,
            event_rx,
            dns_task: None,
        }
    }

    /// The header chain.
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Whether header sync is still outstanding.
    pub fn need_headers(&self) -> bool {
        self.need_headers
    }

    /// Number of connections (including ones still handshaking).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Identities of fully connected peers.
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.connections
            .values()
            .filter_map(|handle| handle.peer.clone())
            .collect()
    }

    /// Run the client until shut down.
    pub async fn run(&mut self) -> NetworkResult<()> {
        info!(
            network = %self.config.network,
            height = self.chain.height(),
            "client starting"
        );

        for addr in self.config.known_peers.clone() {
            self.peer_book.add_seed(addr);
            self.connect_to_new_peer();
        }

        let (dns_tx, mut dns_rx) = mpsc::channel(16);
        self.dns_task = Some(tokio::spawn(discovery::resolve_seeds(
            self.config.network,
            dns_tx,
        )));
        let mut dns_done = false;

        while !self.shutdown {
            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },

                batch = dns_rx.recv(), if !dns_done => match batch {
                    Some(addrs) => self.handle_seed_batch(addrs),
                    None => dns_done = true,
                },

                _ = wait_for(self.header_deadline), if self.header_deadline.is_some() => {
                    self.handle_header_timeout();
                }
            }
        }
        Ok(())
    }

    /// Shut the client down. Idempotent; awaits every connection task so no
    /// socket or timer survives the call.
    pub async fn shutdown(&mut self) {
        if self.shutdown {
            debug!("client already shut down");
            return;
        }
        info!("shutting down client");
        self.shutdown = true;
        self.header_deadline = None;
        self.header_peer = None;

        if let Some(task) = self.dns_task.take() {
            task.abort();
        }

        // Free the event channel so no task blocks on its final report.
        while self.event_rx.try_recv().is_ok() {}

        let handles: Vec<(SocketAddr, PeerHandle)> = self.connections.drain().collect();
        for (addr, mut handle) in handles {
            let _ = handle.commands.try_send(PeerCommand::Shutdown);
            if tokio::time::timeout(Duration::from_secs(1), &mut handle.task)
                .await
                .is_err()
            {
                handle.task.abort();
                let _ = handle.task.await;
            }
            debug!(%addr, "connection shut down");
            while self.event_rx.try_recv().is_ok() {}
        }
    }

    fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr, peer } => self.on_connected(addr, peer),
            PeerEvent::Addrs { entries, .. } => {
                for entry in entries {
                    self.on_peer_gossip(entry);
                }
            }
            PeerEvent::Headers { addr, headers } => self.on_headers(addr, headers),
            PeerEvent::Invs { addr, entries } => {
                for inv in entries {
                    self.on_inv(addr, inv);
                }
            }
            PeerEvent::Closed { addr, reason } => self.on_closed(addr, reason),
        }
    }

    fn handle_seed_batch(&mut self, addrs: Vec<SocketAddr>) {
        debug!(count = addrs.len(), "seed addresses received");
        for addr in addrs {
            self.peer_book.add_seed(addr);
        }
        self.connect_to_new_peer();
    }

    fn on_connected(&mut self, addr: SocketAddr, peer: Peer) {
        info!(%addr, peer = %peer, total = self.connections.len(), "peer connected");
        if let Some(handle) = self.connections.get_mut(&addr) {
            handle.connected = true;
            handle.peer = Some(peer);
        } else {
            warn!(%addr, "connected event for unknown connection");
            return;
        }
        if self.need_headers && self.header_deadline.is_none() {
            info!("starting header download");
            self.sync_more_headers(Some(addr));
        }
    }

    fn on_peer_gossip(&mut self, entry: NetAddr) {
        if !self.peer_book.add_known(entry) {
            debug!(addr = %entry.addr, "ignoring duplicate peer");
            return;
        }
        info!(
            addr = %entry.addr,
            known = self.peer_book.known_len(),
            "added gossiped peer"
        );
        if !self.shutdown
            && self.connections.len() < self.config.max_connections
            && !self.connections.contains_key(&entry.addr)
        {
            self.connect_to_addr(entry.addr);
        }
    }

    fn on_headers(&mut self, addr: SocketAddr, headers: Vec<spv_chain::BlockHeader>) {
        self.header_deadline = None;
        self.header_peer = None;

        let mut inserted = 0usize;
        for header in headers.iter() {
            if self.chain.put_block_header(header.clone()) == InsertOutcome::Inserted {
                inserted += 1;
            }
            // A block announcement is subsumed once its header arrives.
            if self.pending_inv.remove(&Inv::block(header.block_hash)) {
                debug!(hash = %header.block_hash, "cleared pending inv");
            }
        }

        // Every reply is a successful batch, the final empty one included.
        self.save_tip();

        if headers.is_empty() && self.chain.tip_is_recent() {
            info!(tip = %self.chain.tip(), "header sync finished");
            self.need_headers = false;
            return;
        }

        info!(
            tip = %self.chain.tip(),
            received = headers.len(),
            inserted,
            via = %addr,
            "headers applied"
        );
        self.sync_more_headers(None);
    }

    fn need_inv(&self, inv: &Inv) -> bool {
        !self.pending_inv.contains(inv) && !self.chain.has_block(&inv.hash)
    }

    fn on_inv(&mut self, addr: SocketAddr, inv: Inv) {
        if !self.need_inv(&inv) {
            debug!(hash = %inv.hash, "skipping duplicate inv");
            return;
        }
        info!(kind = ?inv.inv_type, hash = %inv.hash, "fetching new inventory");
        self.pending_inv.insert(inv);
        if let Some(handle) = self.connections.get(&addr) {
            if handle.commands.try_send(PeerCommand::GetData(inv)).is_err() {
                warn!(%addr, "getdata dropped; peer command queue full");
                self.pending_inv.remove(&inv);
            }
        }
    }

    fn on_closed(&mut self, addr: SocketAddr, reason: String) {
        if self.connections.remove(&addr).is_none() {
            debug!(%addr, "connection was already removed");
            return;
        }
        warn!(%addr, %reason, remaining = self.connections.len(), "removed connection");
        // Forget the address so a failing peer is not immediately re-picked.
        self.peer_book.remove_known(&addr);
        // A pending header request against this peer is left to its timer.
        self.connect_to_new_peer();
    }

    fn connect_to_new_peer(&mut self) {
        if self.shutdown || self.connections.len() >= self.config.max_connections {
            return;
        }
        let exclude: HashSet<SocketAddr> = self.connections.keys().copied().collect();
        match self.peer_book.select(&exclude) {
            Some(addr) => self.connect_to_addr(addr),
            None => debug!("no peer candidates available"),
        }
    }

    fn connect_to_addr(&mut self, addr: SocketAddr) {
        if self.shutdown {
            return;
        }
        if self.connections.contains_key(&addr) {
            warn!(%addr, "already connected to peer");
            return;
        }
        debug!(%addr, "connecting to peer");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let events = self.event_tx.clone();
        let config = self.config.connection.clone();
        let start_height = self.chain.height() as i32;
        let task = tokio::spawn(async move {
            match Connection::connect(addr, start_height, config).await {
                Ok(connection) => connection.run(events, cmd_rx).await,
                Err(e) => {
                    let _ = events
                        .send(PeerEvent::Closed {
                            addr,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        });
        self.connections.insert(
            addr,
            PeerHandle {
                commands: cmd_tx,
                task,
                connected: false,
                peer: None,
            },
        );
    }

    /// Uniform-random fully connected peer, avoiding `avoid` when an
    /// alternative exists.
    fn random_connected(&self, avoid: Option<SocketAddr>) -> Option<SocketAddr> {
        let mut candidates: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|(_, handle)| handle.connected)
            .map(|(addr, _)| *addr)
            .collect();
        if let Some(avoid) = avoid {
            if candidates.len() > 1 {
                candidates.retain(|addr| *addr != avoid);
            }
        }
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    fn sync_more_headers(&mut self, target: Option<SocketAddr>) {
        match target.or_else(|| self.random_connected(None)) {
            Some(addr) => self.dispatch_get_headers(addr),
            None => warn!("no connected peers for header sync"),
        }
    }

    fn handle_header_timeout(&mut self) {
        self.header_deadline = None;
        let stale = self.header_peer.take();
        warn!(peer = ?stale, "header request timed out");
        // The unresponsive peer stays connected; just ask someone else.
        match self.random_connected(stale) {
            Some(addr) => self.dispatch_get_headers(addr),
            None => warn!("no connected peers to retry header sync"),
        }
    }

    fn dispatch_get_headers(&mut self, addr: SocketAddr) {
        let locator = self.chain.locator();
        let Some(handle) = self.connections.get(&addr) else {
            warn!(%addr, "header sync target disappeared");
            return;
        };
        // Arm the deadline regardless; a stuffed queue resolves like an
        // unresponsive peer.
        self.header_peer = Some(addr);
        self.header_deadline = Some(Instant::now() + self.config.header_timeout);
        if handle
            .commands
            .try_send(PeerCommand::GetHeaders {
                locator,
                hash_stop: Hash::ZERO,
            })
            .is_err()
        {
            warn!(%addr, "header request dropped; peer command queue full");
            return;
        }
        debug!(%addr, height = self.chain.height(), "requesting more headers");
    }

    fn save_tip(&mut self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_tip(self.chain.tip()) {
                warn!(error = %e, "failed to persist chain tip");
            }
        }
    }
}
