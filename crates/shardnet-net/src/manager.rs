use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shardnet_buffer::BlockPool;
use shardnet_core::error::{codes, CoreError, ErrorCategory};
use shardnet_core::{CallContext, Cancellation, Config, Result};
use tokio::sync::mpsc;
use tracing::info;

use crate::adaptor::{BufferTransform, IdentityTransform, ProtocolAdaptorFactory};
use crate::connection::{spawn_connection, Connection};
use crate::event::ManagerEvent;
use crate::handle::{ConnectionId, ListenerId};
use crate::listener::Listener;
use crate::reactor::Reactor;

/// Configuration accepted by [`ConnectionManager::new`]. Groups buffer sizing with
/// reactor worker sizing, accept backlog, and the `reuse_addr`/timeout knobs from
/// [`Config`] in one place.
pub struct ManagerConfig {
    pub worker_count: usize,
    pub buffer_pool_cap: usize,
    pub accept_backlog: i32,
    pub event_channel_capacity: usize,
    /// Whether bound listeners set `SO_REUSEADDR`.
    pub reuse_addr: bool,
    /// Default timeout for [`ConnectionManager::shutdown_default`].
    pub close_timeout_ms: u64,
    /// Outbound connect timeout applied by [`ConnectionManager::create_connection`];
    /// `None` means no timeout.
    pub connection_timeout_ms: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(Config::default())
    }
}

impl From<Config> for ManagerConfig {
    fn from(core: Config) -> Self {
        Self {
            worker_count: core.worker_count,
            buffer_pool_cap: core.buffer_pool_cap,
            accept_backlog: core.accept_backlog as i32,
            event_channel_capacity: 1024,
            reuse_addr: core.reuse_addr,
            close_timeout_ms: core.close_timeout_ms,
            connection_timeout_ms: core.connection_timeout_ms,
        }
    }
}

/// Per-listener bookkeeping kept by the manager so `close_all_listeners` can cancel
/// every running accept loop.
struct ListenerEntry {
    local_addr: SocketAddr,
    cancellation: Cancellation,
}

/// Owns every listener and connection in the process: the single
/// entry point through which sockets are bound, connections are created, and
/// lifecycle events are observed. Connections and listeners are referred to by
/// [`ConnectionId`]/[`ListenerId`], never by a strong reference back into the
/// manager, so the manager can be torn down without chasing `Arc` cycles.
pub struct ConnectionManager {
    pool: BlockPool,
    reactor: Arc<Reactor>,
    transform: Mutex<Arc<dyn BufferTransform>>,
    events_tx: mpsc::Sender<ManagerEvent>,
    connections: Mutex<std::collections::HashMap<ConnectionId, Connection>>,
    listeners: Mutex<std::collections::HashMap<ListenerId, ListenerEntry>>,
    accept_backlog: i32,
    reuse_addr: bool,
    close_timeout: Duration,
    connection_timeout: Option<Duration>,
    shutdown: AtomicBool,
}

impl ConnectionManager {
    /// Spawns the manager's single event-dispatch task alongside the manager itself;
    /// `on_event` is invoked for every connection lifecycle event from the worker
    /// thread that produced it.
    pub fn new(config: ManagerConfig, on_event: impl Fn(ManagerEvent) + Send + 'static) -> Arc<Self> {
        let pool = BlockPool::new(config.buffer_pool_cap);
        let reactor = Arc::new(Reactor::new(config.worker_count));
        let (events_tx, mut events_rx) = mpsc::channel(config.event_channel_capacity);

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                on_event(event);
            }
        });

        Arc::new(Self {
            pool,
            reactor,
            transform: Mutex::new(Arc::new(IdentityTransform)),
            events_tx,
            connections: Mutex::new(std::collections::HashMap::new()),
            listeners: Mutex::new(std::collections::HashMap::new()),
            accept_backlog: config.accept_backlog,
            reuse_addr: config.reuse_addr,
            close_timeout: Duration::from_millis(config.close_timeout_ms),
            connection_timeout: config.connection_timeout_ms.map(Duration::from_millis),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Installs a non-identity buffer transform (e.g. TLS), applied to every
    /// connection created from this point on; connections already open keep whatever
    /// transform they were created with.
    pub fn set_transform(&self, transform: Arc<dyn BufferTransform>) {
        *self.transform.lock() = transform;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CoreError::new(
                codes::NET_MANAGER_SHUTDOWN,
                ErrorCategory::Lifecycle,
                "connection manager is shut down",
            ));
        }
        Ok(())
    }

    /// Binds a listener and starts its accept loop on a background task, registering
    /// every accepted connection with this manager.
    pub fn create_listener(
        self: &Arc<Self>,
        addr: SocketAddr,
        factory: Arc<dyn ProtocolAdaptorFactory>,
    ) -> Result<ListenerId> {
        self.ensure_open()?;
        let listener = Listener::bind(addr, self.accept_backlog, self.reuse_addr)?;
        let id = listener.id();
        let local_addr = listener.local_addr();
        let cancellation = Cancellation::new();

        self.listeners.lock().insert(
            id,
            ListenerEntry {
                local_addr,
                cancellation: cancellation.clone(),
            },
        );

        let manager = self.clone();
        let (connection_tx, mut connection_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(connection) = connection_rx.recv().await {
                manager.connections.lock().insert(connection.id(), connection);
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let ctx = CallContext::new(shardnet_core::Deadline::none(), cancellation);
            listener
                .run_accept_loop(
                    ctx,
                    manager.pool.clone(),
                    factory,
                    manager.transform.lock().clone(),
                    manager.events_tx.clone(),
                    manager.reactor.clone(),
                    connection_tx,
                )
                .await;
            info!(listener_id = %id, "accept loop exited");
        });

        Ok(id)
    }

    /// Dials out and registers the resulting connection.
    pub async fn create_connection(
        self: &Arc<Self>,
        addr: SocketAddr,
        factory: Arc<dyn ProtocolAdaptorFactory>,
    ) -> Result<Connection> {
        self.ensure_open()?;
        let connect = tokio::net::TcpStream::connect(addr);
        let stream = match self.connection_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| CoreError::new(codes::NET_CONNECT, ErrorCategory::Io, "connect timed out"))?
                .map_err(|err| CoreError::io(codes::NET_CONNECT, err))?,
            None => connect.await.map_err(|err| CoreError::io(codes::NET_CONNECT, err))?,
        };
        let id = ConnectionId::next();
        let sink = factory.create_sink(id);
        let connection = spawn_connection(
            id,
            stream,
            self.pool.clone(),
            sink,
            self.transform.lock().clone(),
            self.events_tx.clone(),
            &self.reactor,
        );
        self.connections.lock().insert(id, connection.clone());
        Ok(connection)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.lock().get(&id).cloned()
    }

    /// Closes every open connection, each bounded by `timeout`; waits for all of them to finish closing.
    pub async fn close_all_connections(&self, timeout: Duration) {
        let connections: Vec<Connection> = self.connections.lock().values().cloned().collect();
        let handles: Vec<_> = connections
            .into_iter()
            .map(|c| tokio::spawn(async move { c.close(timeout).await }))
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.connections.lock().clear();
    }

    /// Cancels every listener's accept loop.
    pub fn close_all_listeners(&self) {
        let mut listeners = self.listeners.lock();
        for entry in listeners.values() {
            entry.cancellation.cancel();
        }
        listeners.clear();
    }

    /// Idempotent one-shot shutdown: stops accepting `create_listener`/
    /// `create_connection`, cancels every accept loop, and closes every open
    /// connection bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_all_listeners();
        self.close_all_connections(timeout).await;
        self.pool.close();
    }

    /// Same as [`Self::shutdown`], but falls back to this manager's configured
    /// `close_timeout_ms` instead of requiring the caller to pick one.
    pub async fn shutdown_default(&self) {
        self.shutdown(self.close_timeout).await;
    }

    /// A point-in-time snapshot for observability: per-connection summaries,
    /// per-worker load, and buffer pool accounting.
    pub fn snapshot(&self) -> ManagerSnapshot {
        let connections = self
            .connections
            .lock()
            .values()
            .map(|c| ConnectionSummary {
                id: c.id(),
                peer_addr: c.peer_addr(),
                local_addr: c.local_addr(),
                state: c.state(),
                bytes_in: c.bytes_in(),
                bytes_out: c.bytes_out(),
                queue_depth: c.queue_depth(),
            })
            .collect();
        let listeners = self
            .listeners
            .lock()
            .iter()
            .map(|(id, entry)| ListenerSummary {
                id: *id,
                local_addr: entry.local_addr,
            })
            .collect();
        ManagerSnapshot {
            connections,
            listeners,
            worker_loads: self.reactor.worker_loads(),
            buffers: self.pool.statistics(),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub state: crate::connection::ConnectionState,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub queue_depth: usize,
}

#[derive(Debug)]
pub struct ListenerSummary {
    pub id: ListenerId,
    pub local_addr: SocketAddr,
}

#[derive(Debug)]
pub struct ManagerSnapshot {
    pub connections: Vec<ConnectionSummary>,
    pub listeners: Vec<ListenerSummary>,
    pub worker_loads: Vec<usize>,
    pub buffers: shardnet_buffer::PoolStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_config_default_matches_core_config_defaults() {
        let core = Config::default();
        let manager_cfg = ManagerConfig::default();
        assert_eq!(manager_cfg.reuse_addr, core.reuse_addr);
        assert_eq!(manager_cfg.close_timeout_ms, core.close_timeout_ms);
        assert_eq!(manager_cfg.connection_timeout_ms, core.connection_timeout_ms);
        assert_eq!(manager_cfg.accept_backlog, core.accept_backlog as i32);
    }

    #[test]
    fn manager_config_from_core_config_carries_custom_values() {
        let mut core = Config::default();
        core.reuse_addr = false;
        core.close_timeout_ms = 1234;
        core.connection_timeout_ms = Some(77);
        let manager_cfg = ManagerConfig::from(core);
        assert!(!manager_cfg.reuse_addr);
        assert_eq!(manager_cfg.close_timeout_ms, 1234);
        assert_eq!(manager_cfg.connection_timeout_ms, Some(77));
    }
}
