use std::net::SocketAddr;
use std::sync::Arc;

use shardnet_buffer::BlockPool;
use shardnet_core::error::{codes, CoreError, ErrorCategory};
use shardnet_core::{CallContext, Result};
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener as TokioListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adaptor::{BufferTransform, ProtocolAdaptorFactory};
use crate::connection::{spawn_connection, Connection};
use crate::handle::ListenerId;
use crate::reactor::Reactor;

/// A bound listening socket accepting connections onto the reactor.
pub struct Listener {
    id: ListenerId,
    local_addr: SocketAddr,
    inner: TokioListener,
}

impl Listener {
    /// Binds `addr` with the given backlog and `SO_REUSEADDR` setting before handing
    /// the socket to Tokio.
    pub fn bind(addr: SocketAddr, backlog: i32, reuse_addr: bool) -> Result<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)
            .map_err(|err| CoreError::io(codes::NET_ACCEPT, err))?;
        socket
            .set_reuse_address(reuse_addr)
            .map_err(|err| CoreError::io(codes::NET_ACCEPT, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| CoreError::io(codes::NET_ACCEPT, err))?;
        socket
            .bind(&addr.into())
            .map_err(|err| CoreError::io(codes::NET_ACCEPT, err))?;
        socket
            .listen(backlog)
            .map_err(|err| CoreError::io(codes::NET_ACCEPT, err))?;

        let std_listener: std::net::TcpListener = socket.into();
        let inner = TokioListener::from_std(std_listener).map_err(|err| CoreError::io(codes::NET_ACCEPT, err))?;
        let local_addr = inner.local_addr().map_err(|err| CoreError::io(codes::NET_ACCEPT, err))?;

        Ok(Self {
            id: ListenerId::next(),
            local_addr,
            inner,
        })
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one connection, honoring cancellation and deadline from `ctx`.
    pub async fn accept(&self, ctx: &CallContext) -> Result<(tokio::net::TcpStream, SocketAddr)> {
        if ctx.cancellation().is_cancelled() {
            return Err(CoreError::new(
                codes::NET_MANAGER_SHUTDOWN,
                ErrorCategory::Lifecycle,
                "listener accept cancelled",
            ));
        }
        let accept_fut = self.inner.accept();
        let result = match ctx.deadline().remaining() {
            Some(timeout) => tokio::time::timeout(timeout, accept_fut)
                .await
                .map_err(|_| CoreError::new(codes::NET_ACCEPT, ErrorCategory::Io, "accept timed out"))?,
            None => accept_fut.await,
        };
        result.map_err(|err| CoreError::io(codes::NET_ACCEPT, err))
    }

    /// Runs the accept loop until `ctx` is cancelled, spawning every accepted socket
    /// onto `reactor` and handing the resulting [`Connection`] to `on_connection`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_accept_loop(
        &self,
        ctx: CallContext,
        pool: BlockPool,
        factory: Arc<dyn ProtocolAdaptorFactory>,
        transform: Arc<dyn BufferTransform>,
        events: mpsc::Sender<crate::event::ManagerEvent>,
        reactor: Arc<Reactor>,
        on_connection: mpsc::UnboundedSender<Connection>,
    ) {
        loop {
            match self.accept(&ctx).await {
                Ok((stream, peer)) => {
                    let id = crate::handle::ConnectionId::next();
                    let sink = factory.create_sink(id);
                    let connection =
                        spawn_connection(id, stream, pool.clone(), sink, transform.clone(), events.clone(), &reactor);
                    info!(%peer, %id, "accepted connection");
                    if on_connection.send(connection).is_err() {
                        break;
                    }
                }
                Err(err) if ctx.cancellation().is_cancelled() => {
                    info!(listener_id = %self.id, "listener accept loop stopping: {err}");
                    break;
                }
                Err(err) => {
                    warn!(listener_id = %self.id, "accept failed: {err}");
                }
            }
        }
    }
}
