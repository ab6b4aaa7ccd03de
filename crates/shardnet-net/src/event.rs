use shardnet_core::error::CoreError;

use crate::handle::ConnectionId;

/// Connection lifecycle events delivered to listeners on the connection's owning
/// worker thread. Listeners must not block.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    Eof,
    /// Carries the fault that triggered the close.
    Error(CoreError),
    Closed,
}

#[derive(Debug)]
pub struct ManagerEvent {
    pub connection_id: ConnectionId,
    pub event: ConnectionEvent,
}
