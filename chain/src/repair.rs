//!
//! Startup repair of the topological index.
//!
//! The index (topoheight -> block) and the parent linkage of blocks are written
//! independently, so an unclean shutdown in the middle of a reorganization can leave
//! them disagreeing. Linkage walked backwards from a trusted anchor is taken as ground
//! truth and the index is rewritten to match it within a bounded window.
//!

use crate::{
    api::ChainApi,
    block::{BlockId, TopoEntry},
    errors::{ChainError, ChainResultExt},
};
use helm_core::{debug, info, warn};
use thiserror::Error;

pub const DEFAULT_REPAIR_ANCHOR: u64 = 17_600;
pub const DEFAULT_REPAIR_DEPTH: u64 = 100;

/// Heights `[floor, height_of(anchor block)]` are verified, walking down from the block
/// indexed at topoheight `anchor`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepairWindow {
    pub anchor: u64,
    pub floor: u64,
}

impl RepairWindow {
    pub fn new(anchor: u64, floor: u64) -> Self {
        Self { anchor, floor }
    }

    pub fn with_depth(anchor: u64, depth: u64) -> Self {
        Self { anchor, floor: anchor.saturating_sub(depth) }
    }
}

impl Default for RepairWindow {
    fn default() -> Self {
        Self::with_depth(DEFAULT_REPAIR_ANCHOR, DEFAULT_REPAIR_DEPTH)
    }
}

/// One rewritten index entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Correction {
    pub height: u64,
    /// Block previously stored at `height`, `None` if the entry was missing
    pub stale: Option<BlockId>,
    pub block_id: BlockId,
    pub state_version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Block found at the anchor topoheight, `None` when the chain is not that long yet
    pub anchor: Option<BlockId>,
    pub visited: u64,
    pub corrections: Vec<Correction>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.corrections.is_empty()
    }
}

/// Any failure here leaves the index in an unknown state. Callers must treat it as
/// process-terminating.
#[derive(Error, Debug)]
pub enum RepairError {
    #[error("reading topo index at height {height}: {source}")]
    TopoRead {
        height: u64,
        #[source]
        source: ChainError,
    },

    #[error("writing topo index at height {height}: {source}")]
    TopoWrite {
        height: u64,
        #[source]
        source: ChainError,
    },

    #[error("looking up height of block {block}: {source}")]
    HeightLookup {
        block: BlockId,
        #[source]
        source: ChainError,
    },

    #[error("looking up snapshot version of block {block}: {source}")]
    VersionLookup {
        block: BlockId,
        #[source]
        source: ChainError,
    },

    #[error("resolving linkage of block {block}: {source}")]
    LinkageLookup {
        block: BlockId,
        #[source]
        source: ChainError,
    },

    #[error("block {block} at height {height} has parent {parent} at height {parent_height}")]
    NonDecreasingHeight { block: BlockId, height: u64, parent: BlockId, parent_height: u64 },
}

pub type RepairResult<T> = std::result::Result<T, RepairError>;

/// Rewrites topo index entries in `window` which disagree with the parent chain of the
/// block indexed at `window.anchor`.
///
/// A missing anchor entry means there is nothing to verify yet and is not an error.
/// Running the repair over a consistent index changes nothing.
pub fn repair_topo_index(chain: &dyn ChainApi, window: RepairWindow) -> RepairResult<RepairReport> {
    let anchor = match chain.read_topo(window.anchor).optional() {
        Ok(Some(entry)) => entry.block_id,
        Ok(None) => {
            debug!("No block at topoheight {}, skipping topo index repair", window.anchor);
            return Ok(RepairReport::default());
        }
        Err(source) => return Err(RepairError::TopoRead { height: window.anchor, source }),
    };

    let mut report = RepairReport { anchor: Some(anchor), ..Default::default() };
    let mut current = anchor;
    let mut height = chain.height_of(&current).map_err(|source| RepairError::HeightLookup { block: current, source })?;

    while height >= window.floor {
        let stored = match chain.read_topo(height).optional() {
            Ok(entry) => entry.map(|entry| entry.block_id),
            Err(source) => return Err(RepairError::TopoRead { height, source }),
        };
        report.visited += 1;

        if stored != Some(current) {
            let state_version =
                chain.snapshot_version(&current).map_err(|source| RepairError::VersionLookup { block: current, source })?;
            match stored {
                Some(stale) => warn!("Fixing topo index at height {}: stored {} but chain links to {}", height, stale, current),
                None => warn!("Fixing topo index at height {}: entry missing, chain links to {}", height, current),
            }
            chain
                .write_topo(height, TopoEntry::new(current, state_version, height))
                .map_err(|source| RepairError::TopoWrite { height, source })?;
            report.corrections.push(Correction { height, stale: stored, block_id: current, state_version });
        }

        let linkage = chain.linkage(&current).map_err(|source| RepairError::LinkageLookup { block: current, source })?;
        let Some(parent) = linkage.primary_parent() else {
            debug!("Reached genesis {} while repairing topo index", current);
            break;
        };
        let parent_height = chain.height_of(&parent).map_err(|source| RepairError::HeightLookup { block: parent, source })?;
        if parent_height >= height {
            return Err(RepairError::NonDecreasingHeight { block: current, height, parent, parent_height });
        }
        current = parent;
        height = parent_height;
    }

    if report.is_clean() {
        debug!("Topo index consistent across {} heights below topoheight {}", report.visited, window.anchor);
    } else {
        info!("Repaired {} topo index entries below topoheight {}", report.corrections.len(), window.anchor);
    }
    Ok(report)
}
