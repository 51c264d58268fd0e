//!
//! Peer to peer networking: block announcements exchanged as JSON lines over TCP.
//!

use crate::{
    config::EffectiveConfig,
    lines::{LineReader, LineSender, Offer, line_queue, offer_line},
};
use helm_chain::{Block, ChainError, DynChain, MiniBlock, Network, PeerId, relay::BlockRelayer};
use helm_core::{
    debug, info,
    subsystems::{ActiveSubsystems, SubsystemGuard},
    trace, warn,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    runtime::Handle,
    select,
};
use triggered::{Listener, Trigger, trigger};

const P2P: &str = "p2p";

#[derive(Error, Debug)]
pub enum P2pError {
    #[error("failed binding p2p listener to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("p2p node was already started")]
    AlreadyStarted,
}

pub type P2pResult<T> = std::result::Result<T, P2pError>;

/// Networking subsystem as seen by the orchestrator
pub trait P2pApi: Send + Sync {
    fn start(&self, chain: DynChain) -> P2pResult<()>;

    fn shutdown(&self) -> P2pResult<()>;

    /// Announces `block` to every connected peer but `exclude`
    fn broadcast_block(&self, block: &Block, exclude: PeerId);

    /// Announces `mini_block` to every connected peer but `exclude`
    fn broadcast_mini_block(&self, mini_block: &MiniBlock, exclude: PeerId);

    fn peer_count(&self) -> usize;
}

pub type DynP2p = Arc<dyn P2pApi>;

/// Hands blocks accepted by the chain engine over to the networking subsystem
pub struct P2pRelayer {
    p2p: DynP2p,
}

impl P2pRelayer {
    pub fn new(p2p: DynP2p) -> Self {
        Self { p2p }
    }
}

impl BlockRelayer for P2pRelayer {
    fn relay_block(&self, block: &Block, origin: PeerId) {
        self.p2p.broadcast_block(block, origin);
    }

    fn relay_mini_block(&self, mini_block: &MiniBlock, origin: PeerId) {
        self.p2p.broadcast_mini_block(mini_block, origin);
    }
}

#[derive(Clone, Debug)]
pub struct P2pConfig {
    pub network: Network,
    pub bind: SocketAddr,
    pub exclusive_nodes: Vec<String>,
    pub priority_nodes: Vec<String>,
    pub min_peers: u64,
    pub node_tag: Option<String>,
    pub socks_proxy: Option<String>,
}

impl From<&EffectiveConfig> for P2pConfig {
    fn from(config: &EffectiveConfig) -> Self {
        Self {
            network: config.network,
            bind: config.p2p_bind,
            exclusive_nodes: config.exclusive_nodes.clone(),
            priority_nodes: config.priority_nodes.clone(),
            min_peers: config.min_peers,
            node_tag: config.node_tag.clone(),
            socks_proxy: config.socks_proxy.clone(),
        }
    }
}

impl P2pConfig {
    /// Peers dialed at startup. Exclusive nodes replace every other peer source.
    pub fn outbound_peers(&self) -> &[String] {
        if self.exclusive_nodes.is_empty() { &self.priority_nodes } else { &self.exclusive_nodes }
    }
}

/// One line on the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Announcement {
    Hello { network: String, tag: Option<String> },
    Block { block: Block },
    MiniBlock { mini_block: MiniBlock },
}

struct Inner {
    config: P2pConfig,
    handle: Handle,
    peers: Mutex<HashMap<PeerId, LineSender>>,
    next_peer_id: AtomicU64,
    dropped_peers: AtomicUsize,
    shutdown: (Trigger, Listener),
}

/// TCP peer node. Inbound peers are accepted on [`P2pConfig::bind`] unless disabled, outbound
/// peers are dialed once at start.
pub struct P2pNode {
    inner: Arc<Inner>,
    guard: Mutex<Option<Arc<SubsystemGuard>>>,
    subsystems: Arc<ActiveSubsystems>,
}

impl P2pNode {
    pub fn new(config: P2pConfig, handle: Handle, subsystems: Arc<ActiveSubsystems>) -> Self {
        let inner = Inner {
            config,
            handle,
            peers: Mutex::new(HashMap::new()),
            // 0 is reserved for locally produced blocks
            next_peer_id: AtomicU64::new(1),
            dropped_peers: AtomicUsize::new(0),
            shutdown: trigger(),
        };
        Self { inner: Arc::new(inner), guard: Mutex::new(None), subsystems }
    }

    /// Number of peers disconnected for a protocol violation, such as a foreign network
    pub fn dropped_peers(&self) -> usize {
        self.inner.dropped_peers.load(Ordering::SeqCst)
    }

    fn bind(&self) -> P2pResult<TcpListener> {
        let addr = self.inner.config.bind;
        let _enter = self.inner.handle.enter();
        std::net::TcpListener::bind(addr)
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)
            })
            .map_err(|source| P2pError::Bind { addr, source })
    }
}

impl Inner {
    fn hello(&self) -> Announcement {
        Announcement::Hello { network: self.config.network.name().to_string(), tag: self.config.node_tag.clone() }
    }

    fn broadcast(&self, announcement: &Announcement, exclude: PeerId) {
        let line = match serde_json::to_string(announcement) {
            Ok(line) => line,
            Err(err) => {
                warn!("[{}] failed encoding announcement: {}", P2P, err);
                return;
            }
        };
        let peers = self.peers.lock();
        for (peer_id, sender) in peers.iter().filter(|(peer_id, _)| **peer_id != exclude) {
            match offer_line(sender, line.clone()) {
                Offer::Queued => {}
                Offer::Dropped => debug!("[{}] peer {} is too slow, dropped an announcement", P2P, peer_id),
                Offer::Closed => trace!("[{}] peer {} is gone", P2P, peer_id),
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, chain: DynChain, guard: Arc<SubsystemGuard>) {
        let shutdown = self.shutdown.1.clone();
        loop {
            select! {
                biased;
                _ = shutdown.clone() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("[{}] inbound peer {}", P2P, addr);
                        tokio::spawn(self.clone().session(stream, addr, chain.clone(), guard.clone()));
                    }
                    Err(err) => warn!("[{}] failed accepting peer: {}", P2P, err),
                }
            }
        }
        trace!("[{}] accept loop exited", P2P);
    }

    async fn dial(self: Arc<Self>, address: String, chain: DynChain, guard: Arc<SubsystemGuard>) {
        let shutdown = self.shutdown.1.clone();
        let stream = select! {
            biased;
            _ = shutdown => return,
            stream = TcpStream::connect(address.as_str()) => stream,
        };
        match stream.and_then(|stream| Ok((stream.peer_addr()?, stream))) {
            Ok((addr, stream)) => {
                debug!("[{}] connected to peer {}", P2P, addr);
                self.session(stream, addr, chain, guard).await;
            }
            Err(err) => warn!("[{}] failed connecting to peer {}: {}", P2P, address, err),
        }
    }

    async fn session(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, chain: DynChain, _guard: Arc<SubsystemGuard>) {
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let (read, mut write) = stream.into_split();
        let (sender, mut receiver) = line_queue();
        if let Ok(hello) = serde_json::to_string(&self.hello()) {
            offer_line(&sender, hello);
        }
        self.peers.lock().insert(peer_id, sender);

        let writer = tokio::spawn(async move {
            while let Some(mut line) = receiver.recv().await {
                line.push('\n');
                if let Err(err) = write.write_all(line.as_bytes()).await {
                    debug!("[{}] peer {} write failed: {}", P2P, peer_id, err);
                    break;
                }
            }
        });

        let shutdown = self.shutdown.1.clone();
        let mut lines = LineReader::new(read);
        loop {
            let line = select! {
                biased;
                _ = shutdown.clone() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if !self.handle_line(peer_id, addr, &line, &chain) {
                        self.dropped_peers.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("[{}] peer {} read failed: {}", P2P, addr, err);
                    break;
                }
            }
        }

        self.peers.lock().remove(&peer_id);
        writer.abort();
        debug!("[{}] peer {} ({}) disconnected", P2P, peer_id, addr);
    }

    /// Returns false when the peer must be dropped
    fn handle_line(&self, peer_id: PeerId, addr: SocketAddr, line: &str, chain: &DynChain) -> bool {
        let announcement = match serde_json::from_str::<Announcement>(line) {
            Ok(announcement) => announcement,
            Err(err) => {
                warn!("[{}] peer {} sent a malformed announcement: {}", P2P, addr, err);
                return false;
            }
        };
        let result = match announcement {
            Announcement::Hello { network, tag } => {
                if network != self.config.network.name() {
                    warn!("[{}] peer {} is on {}, dropping", P2P, addr, network);
                    return false;
                }
                debug!("[{}] peer {} says hello (tag: {})", P2P, addr, tag.as_deref().unwrap_or("none"));
                Ok(())
            }
            Announcement::Block { block } => chain.accept_block(block, peer_id).map(|_| ()),
            Announcement::MiniBlock { mini_block } => chain.accept_mini_block(mini_block, peer_id),
        };
        match result {
            Ok(()) | Err(ChainError::BlockAlreadyExists(_)) => true,
            Err(err) => {
                debug!("[{}] rejected announcement from peer {}: {}", P2P, addr, err);
                true
            }
        }
    }
}

impl P2pApi for P2pNode {
    fn start(&self, chain: DynChain) -> P2pResult<()> {
        let mut guard_slot = self.guard.lock();
        if guard_slot.is_some() {
            return Err(P2pError::AlreadyStarted);
        }
        let guard = Arc::new(self.subsystems.guard());
        let config = &self.inner.config;

        if EffectiveConfig::is_enabled(&config.bind) {
            let listener = self.bind()?;
            info!("[{}] listening for peers on {}", P2P, config.bind);
            self.inner.handle.spawn(self.inner.clone().accept_loop(listener, chain.clone(), guard.clone()));
        } else {
            info!("[{}] not listening for peers", P2P);
        }

        if config.socks_proxy.is_some() {
            info!("[{}] outbound peers are not dialed while a socks proxy is configured", P2P);
        } else {
            for address in config.outbound_peers() {
                self.inner.handle.spawn(self.inner.clone().dial(address.clone(), chain.clone(), guard.clone()));
            }
        }

        debug!("[{}] started, targeting {} peers", P2P, config.min_peers);
        guard_slot.replace(guard);
        Ok(())
    }

    fn shutdown(&self) -> P2pResult<()> {
        self.inner.shutdown.0.trigger();
        self.inner.peers.lock().clear();
        if self.guard.lock().take().is_some() {
            info!("[{}] shutting down", P2P);
        }
        Ok(())
    }

    fn broadcast_block(&self, block: &Block, exclude: PeerId) {
        self.inner.broadcast(&Announcement::Block { block: block.clone() }, exclude);
    }

    fn broadcast_mini_block(&self, mini_block: &MiniBlock, exclude: PeerId) {
        self.inner.broadcast(&Announcement::MiniBlock { mini_block: mini_block.clone() }, exclude);
    }

    fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }
}
