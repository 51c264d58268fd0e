use crate::block::BlockId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("block {0} not found")]
    BlockNotFound(BlockId),

    #[error("no block indexed at topoheight {0}")]
    TopoNotFound(u64),

    #[error("block {0} is already known")]
    BlockAlreadyExists(BlockId),

    #[error("block {block} references unknown parent {parent}")]
    MissingParent { block: BlockId, parent: BlockId },

    #[error("cannot prune to topoheight {requested}, chain tip is at topoheight {tip}")]
    PruneBeyondTip { requested: u64, tip: u64 },

    #[error("chain engine is not running")]
    NotRunning,

    #[error("data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),
}

impl ChainError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChainError::BlockNotFound(_) | ChainError::TopoNotFound(_))
    }
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Extension methods for chain results
pub trait ChainResultExt<T> {
    /// Converts a "not found" error into absence.
    ///
    /// Mapping:
    /// - `Ok(v)` -> `Ok(Some(v))`
    /// - `Err(e)` where `e.is_not_found()` -> `Ok(None)`
    /// - any other `Err(e)` -> `Err(e)`
    fn optional(self) -> ChainResult<Option<T>>;
}

impl<T> ChainResultExt<T> for ChainResult<T> {
    fn optional(self) -> ChainResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}
