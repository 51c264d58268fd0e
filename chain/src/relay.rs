use crate::block::{Block, MiniBlock, PeerId};
use std::sync::Arc;

/// Callback seam through which the engine hands accepted blocks to the network.
///
/// The engine only knows this trait. The orchestrator registers an implementation
/// backed by the p2p subsystem before the node starts serving.
pub trait BlockRelayer: Send + Sync {
    /// Called for every newly accepted full block. `origin` must not be relayed back to.
    fn relay_block(&self, block: &Block, origin: PeerId);

    /// Called for every newly accepted mini block. `origin` must not be relayed back to.
    fn relay_mini_block(&self, mini_block: &MiniBlock, origin: PeerId);
}

pub type DynBlockRelayer = Arc<dyn BlockRelayer>;
