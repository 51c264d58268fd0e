pub mod api;
pub mod block;
pub mod errors;
pub mod memory;
pub mod relay;
pub mod repair;

pub use api::{ChainApi, ChainFactory, ChainParams, DynChain, Network};
pub use block::{Block, BlockId, BlockLinkage, MiniBlock, PeerId, TopoEntry};
pub use errors::{ChainError, ChainResult, ChainResultExt};
