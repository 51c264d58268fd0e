use crate::{
    block::{Block, BlockId, BlockLinkage, MiniBlock, PeerId, TopoEntry},
    errors::ChainResult,
    relay::DynBlockRelayer,
};
use helm_core::subsystems::ActiveSubsystems;
use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
    sync::Arc,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(self, Network::Mainnet)
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters the chain engine is started with
#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub data_dir: PathBuf,
    /// Beneficiary of integrator rewards for blocks mined by this node
    pub integrator_address: Option<String>,
    /// Fast sync only has an effect while bootstrapping
    pub fastsync: bool,
    /// Local clock is trusted, no time sync is attempted
    pub time_is_in_sync: bool,
}

/// Chain engine as seen by the node: topological index access, block linkage reads,
/// block acceptance and the relay hook.
pub trait ChainApi: Send + Sync {
    /// Reads the topological index entry at `topoheight`
    fn read_topo(&self, topoheight: u64) -> ChainResult<TopoEntry>;

    /// Overwrites the topological index entry at `topoheight`
    fn write_topo(&self, topoheight: u64, entry: TopoEntry) -> ChainResult<()>;

    /// Highest topoheight present in the index
    fn topo_height(&self) -> ChainResult<u64>;

    fn height_of(&self, id: &BlockId) -> ChainResult<u64>;

    /// State snapshot version committed together with `id`
    fn snapshot_version(&self, id: &BlockId) -> ChainResult<u64>;

    fn linkage(&self, id: &BlockId) -> ChainResult<BlockLinkage>;

    fn accept_block(&self, block: Block, origin: PeerId) -> ChainResult<TopoEntry>;

    fn accept_mini_block(&self, mini_block: MiniBlock, origin: PeerId) -> ChainResult<()>;

    /// Installs the hook called for every accepted block. Replaces any previous relayer.
    fn register_relayer(&self, relayer: DynBlockRelayer);

    fn shutdown(&self) -> ChainResult<()>;
}

pub type DynChain = Arc<dyn ChainApi>;

/// Starts chain engines and performs offline maintenance on their data
pub trait ChainFactory: Send + Sync {
    /// Starts an engine. The engine counts itself in `subsystems` until it is shut down.
    fn start(&self, params: &ChainParams, subsystems: Arc<ActiveSubsystems>) -> ChainResult<DynChain>;

    /// Discards block history below `topoheight`. Runs before the engine is started.
    fn prune(&self, params: &ChainParams, topoheight: u64) -> ChainResult<()>;
}
