use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::str::{self, FromStr};

pub const BLOCK_ID_SIZE: usize = 32;

/// Identifier of the peer a block arrived from. Locally produced blocks use [`LOCAL_PEER`].
pub type PeerId = u64;

pub const LOCAL_PEER: PeerId = 0;

#[derive(PartialEq, Eq, Clone, Copy, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId([u8; BLOCK_ID_SIZE]);

impl BlockId {
    pub const fn from_bytes(bytes: [u8; BLOCK_ID_SIZE]) -> Self {
        BlockId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_ID_SIZE] {
        &self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut hex = [0u8; BLOCK_ID_SIZE * 2];
        hex::encode_to_slice(self.0, &mut hex).map_err(|_| std::fmt::Error)?;
        f.write_str(str::from_utf8(&hex).map_err(|_| std::fmt::Error)?)
    }
}

impl Debug for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for BlockId {
    type Err = hex::FromHexError;

    fn from_str(id_str: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; BLOCK_ID_SIZE];
        hex::decode_to_slice(id_str, &mut bytes)?;
        Ok(BlockId(bytes))
    }
}

/// Places the word in the first 8 bytes (little endian). Handy for deterministic test ids.
impl From<u64> for BlockId {
    fn from(word: u64) -> Self {
        let mut bytes = [0u8; BLOCK_ID_SIZE];
        bytes[..8].copy_from_slice(&word.to_le_bytes());
        BlockId(bytes)
    }
}

/// Identity, height and parents ("tips") of a block. Read-only for everything but the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLinkage {
    pub id: BlockId,
    pub height: u64,
    pub tips: Vec<BlockId>,
}

impl BlockLinkage {
    pub fn new(id: BlockId, height: u64, tips: Vec<BlockId>) -> Self {
        Self { id, height, tips }
    }

    /// The chain-canonical predecessor, `None` for genesis
    pub fn primary_parent(&self) -> Option<BlockId> {
        self.tips.first().copied()
    }
}

/// A full block as handed to the relay hooks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub linkage: BlockLinkage,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn new(linkage: BlockLinkage, timestamp: u64, payload: Vec<u8>) -> Self {
        Self { linkage, timestamp, payload }
    }

    pub fn id(&self) -> BlockId {
        self.linkage.id
    }

    pub fn height(&self) -> u64 {
        self.linkage.height
    }
}

/// The lightweight block variant produced during a mining round
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniBlock {
    pub id: BlockId,
    pub height: u64,
    pub past: Vec<BlockId>,
    pub timestamp: u64,
}

/// Topological index record: the block occupying a topological height, the state snapshot
/// version committed with it, and the height it was written under
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopoEntry {
    pub block_id: BlockId,
    pub state_version: u64,
    pub height: u64,
}

impl TopoEntry {
    pub fn new(block_id: BlockId, state_version: u64, height: u64) -> Self {
        Self { block_id, state_version, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_basics() {
        let id_str = "8e40af02265360d59f4ecf9ae9ebf8f00a3118408f5a9cdcbcc9c0f93642f3af";
        let id = BlockId::from_str(id_str).unwrap();
        assert_eq!(id_str, id.to_string());
        assert_eq!(format!("{:?}", id), id_str);

        let other = BlockId::from_str("8e40af02265360d59f4ecf9ae9ebf8f00a3118408f5a9cdcbcc9c0f93642f3ab").unwrap();
        assert_ne!(id, other);

        assert_eq!(BlockId::from_str("8e40af"), Err(hex::FromHexError::InvalidStringLength));
        assert_eq!(BlockId::from_str("8e40a"), Err(hex::FromHexError::OddLength));
    }

    #[test]
    fn test_primary_parent() {
        let genesis = BlockLinkage::new(1.into(), 0, vec![]);
        assert_eq!(genesis.primary_parent(), None);
        let child = BlockLinkage::new(3.into(), 1, vec![1.into(), 2.into()]);
        assert_eq!(child.primary_parent(), Some(1.into()));
    }
}
