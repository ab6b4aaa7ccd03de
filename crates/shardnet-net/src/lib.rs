#![deny(unsafe_code)]
#![doc = "shardnet-net: the connection manager, reactor and per-connection actor that drive"]
#![doc = "shardnet-wire envelopes over non-blocking TCP sockets."]
#![doc = ""]
#![doc = "Connections and listeners are referred to by handle (`ConnectionId`/`ListenerId`)"]
#![doc = "rather than by strong reference, and every accept/connect/close takes its deadline and"]
#![doc = "cancellation token explicitly through a `shardnet_core::CallContext` instead of picking"]
#![doc = "either up from ambient state."]

mod adaptor;
mod connection;
mod event;
mod handle;
mod listener;
mod manager;
mod reactor;

pub use adaptor::{BufferTransform, IdentityTransform, MessageSink, ProtocolAdaptorFactory};
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use event::{ConnectionEvent, ManagerEvent};
pub use handle::{ConnectionId, ListenerId};
pub use listener::Listener;
pub use manager::{ConnectionManager, ConnectionSummary, ListenerSummary, ManagerConfig, ManagerSnapshot};
pub use reactor::Reactor;
