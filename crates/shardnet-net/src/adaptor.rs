use shardnet_buffer::BlockChain;
use shardnet_core::Result;

use crate::handle::ConnectionId;

/// Receives fully reassembled logical messages from a connection's framer. Invoked on the connection's owning worker thread; takes ownership
/// of the chain and must release its blocks (dropping it is enough).
pub trait MessageSink: Send {
    fn on_message(&mut self, message_type: u8, session_id: u64, chain: BlockChain);
}

/// Produces a fresh [`MessageSink`] for each accepted or outbound connection.
pub trait ProtocolAdaptorFactory: Send + Sync {
    fn create_sink(&self, connection_id: ConnectionId) -> Box<dyn MessageSink>;
}

/// Optional transform layer around raw socket I/O — e.g. TLS — supplying a pair of
/// functions operating over block chains. The
/// default is the identity transform: raw socket bytes pass through unmodified.
pub trait BufferTransform: Send + Sync {
    fn wrap_read(&self, chain: BlockChain) -> Result<BlockChain>;
    fn wrap_write(&self, chain: BlockChain) -> Result<BlockChain>;
}

pub struct IdentityTransform;

impl BufferTransform for IdentityTransform {
    fn wrap_read(&self, chain: BlockChain) -> Result<BlockChain> {
        Ok(chain)
    }

    fn wrap_write(&self, chain: BlockChain) -> Result<BlockChain> {
        Ok(chain)
    }
}
