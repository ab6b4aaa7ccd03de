#![deny(unsafe_code)]
#![doc = "shardnet-buffer: the direct-buffer pool and the block/block-chain data"]
#![doc = "model that every layer above builds on."]
#![doc = ""]
#![doc = "`Block` owns a leased `bytes::BytesMut`/`bytes::Bytes` and returns it to its pool on"]
#![doc = "`Drop`, so callers never have to remember to release explicitly — the same discipline"]
#![doc = "`PooledBuffer`'s `Lease` uses, just scoped to the block/chain vocabulary this transport"]
#![doc = "speaks instead of a generic `WritableBuffer`."]

mod block;
mod chain;
mod pool;

pub use block::Block;
pub use chain::BlockChain;
pub use pool::{BlockPool, PoolStats};
