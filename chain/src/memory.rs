//!
//! In-memory chain engine persisted as a single bincode snapshot in the data directory.
//!

use crate::{
    api::{ChainApi, ChainFactory, ChainParams, DynChain, Network},
    block::{Block, BlockId, BlockLinkage, MiniBlock, PeerId, TopoEntry},
    errors::{ChainError, ChainResult},
    relay::DynBlockRelayer,
};
use helm_core::{
    debug, info,
    subsystems::{ActiveSubsystems, SubsystemGuard},
    trace,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

pub const SNAPSHOT_FILE_NAME: &str = "chain.bin";

pub const MAINNET_GENESIS: BlockId = BlockId::from_bytes([
    0xe1, 0x4a, 0x2c, 0x77, 0x09, 0x5b, 0xd3, 0x41, 0x8f, 0x60, 0x1e, 0xa2, 0x3c, 0x94, 0x57, 0x0b, 0xc8, 0x11, 0x6d, 0xf0, 0x25,
    0x9e, 0x7a, 0x43, 0xb6, 0x02, 0xdd, 0x58, 0x8c, 0x31, 0xe9, 0x64,
]);

pub const TESTNET_GENESIS: BlockId = BlockId::from_bytes([
    0x3f, 0xb8, 0x05, 0x6e, 0xa1, 0x92, 0x4c, 0xd7, 0x20, 0x7b, 0xe5, 0x19, 0x66, 0x0d, 0xf3, 0x8a, 0x54, 0xc2, 0x37, 0x9b, 0x0e,
    0x71, 0xaa, 0x4d, 0xde, 0x83, 0x16, 0x62, 0xbf, 0x28, 0x95, 0x0c,
]);

pub fn genesis_id(network: Network) -> BlockId {
    match network {
        Network::Mainnet => MAINNET_GENESIS,
        Network::Testnet => TESTNET_GENESIS,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredBlock {
    linkage: BlockLinkage,
    state_version: u64,
    timestamp: u64,
    /// `None` once pruned
    payload: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ChainState {
    topo: BTreeMap<u64, TopoEntry>,
    blocks: HashMap<BlockId, StoredBlock>,
    next_version: u64,
    pruned_below: u64,
}

impl ChainState {
    fn with_genesis(genesis: BlockId) -> Self {
        let mut state = Self::default();
        state.insert(BlockLinkage::new(genesis, 0, vec![]), 0, 0, Some(vec![]));
        state.topo.insert(0, TopoEntry::new(genesis, 0, 0));
        state
    }

    fn insert(&mut self, linkage: BlockLinkage, state_version: u64, timestamp: u64, payload: Option<Vec<u8>>) {
        self.next_version = self.next_version.max(state_version + 1);
        self.blocks.insert(linkage.id, StoredBlock { linkage, state_version, timestamp, payload });
    }

    fn block(&self, id: &BlockId) -> ChainResult<&StoredBlock> {
        self.blocks.get(id).ok_or(ChainError::BlockNotFound(*id))
    }

    fn tip_topoheight(&self) -> u64 {
        self.topo.keys().next_back().copied().unwrap_or_default()
    }

    fn next_topoheight(&self) -> u64 {
        self.topo.keys().next_back().map_or(0, |tip| tip + 1)
    }

    fn load(path: &Path) -> ChainResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }

    /// Writes to a sibling temp file first so a crash never leaves a truncated snapshot
    fn save(&self, path: &Path) -> ChainResult<()> {
        let tmp_path = path.with_extension("tmp");
        {
            let writer = BufWriter::new(File::create(&tmp_path)?);
            bincode::serialize_into(writer, self)?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Chain engine keeping the whole chain in memory.
///
/// Every accepted block gets the next topoheight and a fresh state version. The state is
/// written back to the snapshot file on shutdown.
pub struct MemoryChain {
    state: RwLock<ChainState>,
    snapshot_path: Option<PathBuf>,
    relayer: RwLock<Option<DynBlockRelayer>>,
    is_shut_down: AtomicBool,
    guard: Mutex<Option<SubsystemGuard>>,
}

impl MemoryChain {
    fn from_state(state: ChainState, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(state),
            snapshot_path,
            relayer: RwLock::new(None),
            is_shut_down: AtomicBool::new(false),
            guard: Mutex::new(None),
        }
    }

    /// An unpersisted chain holding only `genesis`
    pub fn with_genesis(genesis: BlockId) -> Self {
        Self::from_state(ChainState::with_genesis(genesis), None)
    }

    /// Loads the snapshot at `path`, or starts from genesis if there is none yet
    pub fn open(path: impl Into<PathBuf>, network: Network) -> ChainResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            let state = ChainState::load(&path)?;
            debug!("Loaded chain snapshot {} at topoheight {}", path.display(), state.tip_topoheight());
            state
        } else {
            debug!("No chain snapshot at {}, starting from {} genesis", path.display(), network);
            ChainState::with_genesis(genesis_id(network))
        };
        Ok(Self::from_state(state, Some(path)))
    }

    /// Stores `linkage` and indexes it at `linkage.height`, bypassing acceptance checks.
    /// Overwrites any block with the same id.
    pub fn insert_linkage(&self, linkage: BlockLinkage, state_version: u64) -> ChainResult<TopoEntry> {
        let mut state = self.state.write();
        let entry = TopoEntry::new(linkage.id, state_version, linkage.height);
        state.topo.insert(linkage.height, entry);
        state.insert(linkage, state_version, 0, None);
        Ok(entry)
    }

    pub fn remove_topo(&self, topoheight: u64) -> Option<TopoEntry> {
        self.state.write().topo.remove(&topoheight)
    }

    pub fn topo_entries(&self) -> Vec<(u64, TopoEntry)> {
        self.state.read().topo.iter().map(|(topoheight, entry)| (*topoheight, *entry)).collect()
    }

    /// Topoheight below which block payloads have been discarded
    pub fn pruned_below(&self) -> u64 {
        self.state.read().pruned_below
    }

    pub fn has_payload(&self, id: &BlockId) -> ChainResult<bool> {
        Ok(self.state.read().block(id)?.payload.is_some())
    }

    /// Discards payloads of blocks indexed below `topoheight`. Linkage and index survive.
    pub fn prune(&self, topoheight: u64) -> ChainResult<usize> {
        let mut state = self.state.write();
        let tip = state.tip_topoheight();
        if topoheight > tip {
            return Err(ChainError::PruneBeyondTip { requested: topoheight, tip });
        }
        let doomed = state.topo.range(..topoheight).map(|(_, entry)| entry.block_id).collect::<Vec<_>>();
        let mut pruned = 0;
        for id in doomed {
            if let Some(block) = state.blocks.get_mut(&id) {
                if block.payload.take().is_some() {
                    pruned += 1;
                }
            }
        }
        state.pruned_below = state.pruned_below.max(topoheight);
        Ok(pruned)
    }

    pub fn save(&self) -> ChainResult<()> {
        match &self.snapshot_path {
            Some(path) => self.state.read().save(path),
            None => Ok(()),
        }
    }

    fn ensure_running(&self) -> ChainResult<()> {
        if self.is_shut_down.load(Ordering::SeqCst) {
            return Err(ChainError::NotRunning);
        }
        Ok(())
    }

    fn relayer(&self) -> Option<DynBlockRelayer> {
        self.relayer.read().clone()
    }
}

impl ChainApi for MemoryChain {
    fn read_topo(&self, topoheight: u64) -> ChainResult<TopoEntry> {
        self.state.read().topo.get(&topoheight).copied().ok_or(ChainError::TopoNotFound(topoheight))
    }

    fn write_topo(&self, topoheight: u64, entry: TopoEntry) -> ChainResult<()> {
        self.state.write().topo.insert(topoheight, entry);
        Ok(())
    }

    fn topo_height(&self) -> ChainResult<u64> {
        Ok(self.state.read().tip_topoheight())
    }

    fn height_of(&self, id: &BlockId) -> ChainResult<u64> {
        Ok(self.state.read().block(id)?.linkage.height)
    }

    fn snapshot_version(&self, id: &BlockId) -> ChainResult<u64> {
        Ok(self.state.read().block(id)?.state_version)
    }

    fn linkage(&self, id: &BlockId) -> ChainResult<BlockLinkage> {
        Ok(self.state.read().block(id)?.linkage.clone())
    }

    fn accept_block(&self, block: Block, origin: PeerId) -> ChainResult<TopoEntry> {
        self.ensure_running()?;
        let entry = {
            let mut state = self.state.write();
            let id = block.id();
            if state.blocks.contains_key(&id) {
                return Err(ChainError::BlockAlreadyExists(id));
            }
            if block.linkage.tips.is_empty() {
                return Err(ChainError::DataInconsistency(format!("block {} has no parents", id)));
            }
            for parent in block.linkage.tips.iter() {
                let parent_height = state.blocks.get(parent).ok_or(ChainError::MissingParent { block: id, parent: *parent })?.linkage.height;
                if parent_height >= block.height() {
                    return Err(ChainError::DataInconsistency(format!(
                        "block {} at height {} has parent {} at height {}",
                        id,
                        block.height(),
                        parent,
                        parent_height
                    )));
                }
            }

            let topoheight = state.next_topoheight();
            let state_version = state.next_version;
            let entry = TopoEntry::new(id, state_version, block.height());
            state.insert(block.linkage.clone(), state_version, block.timestamp, Some(block.payload.clone()));
            state.topo.insert(topoheight, entry);
            trace!("Accepted block {} at topoheight {} from peer {}", id, topoheight, origin);
            entry
        };

        if let Some(relayer) = self.relayer() {
            relayer.relay_block(&block, origin);
        }
        Ok(entry)
    }

    fn accept_mini_block(&self, mini_block: MiniBlock, origin: PeerId) -> ChainResult<()> {
        self.ensure_running()?;
        {
            let state = self.state.read();
            if let Some(parent) = mini_block.past.iter().find(|parent| !state.blocks.contains_key(parent)) {
                return Err(ChainError::MissingParent { block: mini_block.id, parent: *parent });
            }
        }
        if let Some(relayer) = self.relayer() {
            relayer.relay_mini_block(&mini_block, origin);
        }
        Ok(())
    }

    fn register_relayer(&self, relayer: DynBlockRelayer) {
        self.relayer.write().replace(relayer);
    }

    fn shutdown(&self) -> ChainResult<()> {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.relayer.write().take();
        let result = self.save();
        // Released even when the snapshot could not be written
        self.guard.lock().take();
        info!("Chain engine stopped at topoheight {}", self.state.read().tip_topoheight());
        result
    }
}

/// Starts [`MemoryChain`] engines from the snapshot under [`ChainParams::data_dir`]
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryChainFactory;

impl MemoryChainFactory {
    pub fn snapshot_path(params: &ChainParams) -> PathBuf {
        params.data_dir.join(SNAPSHOT_FILE_NAME)
    }
}

impl ChainFactory for MemoryChainFactory {
    fn start(&self, params: &ChainParams, subsystems: Arc<ActiveSubsystems>) -> ChainResult<DynChain> {
        fs::create_dir_all(&params.data_dir)?;
        let chain = MemoryChain::open(Self::snapshot_path(params), params.network)?;
        chain.guard.lock().replace(subsystems.guard());
        info!(
            "Chain engine started on {} at topoheight {} (fastsync: {}, time in sync: {})",
            params.network,
            chain.topo_height()?,
            params.fastsync,
            params.time_is_in_sync
        );
        if let Some(address) = &params.integrator_address {
            info!("Integrator rewards go to {}", address);
        }
        Ok(Arc::new(chain))
    }

    fn prune(&self, params: &ChainParams, topoheight: u64) -> ChainResult<()> {
        let chain = MemoryChain::open(Self::snapshot_path(params), params.network)?;
        let pruned = chain.prune(topoheight)?;
        fs::create_dir_all(&params.data_dir)?;
        chain.save()?;
        info!("Pruned {} block payloads below topoheight {}", pruned, topoheight);
        Ok(())
    }
}
