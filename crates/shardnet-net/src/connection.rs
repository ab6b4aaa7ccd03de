use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shardnet_buffer::{BlockChain, BlockPool};
use shardnet_core::error::{codes, CoreError, ErrorCategory};
use shardnet_core::Result;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::adaptor::{BufferTransform, MessageSink};
use crate::handle::ConnectionId;
use crate::reactor::{LoadGuard, Reactor};

use shardnet_wire::Accumulator;

/// Per-connection lifecycle: `Init` is implicit (the state a [`Connection`]
/// is in before its task is spawned); everything from `Connecting` on is tracked here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Default)]
pub struct ConnectionStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub queue_depth: AtomicUsize,
}

enum Command {
    Write(BlockChain, oneshot::Sender<Result<()>>),
    CloseGraceful(Duration, Option<oneshot::Sender<()>>),
}

struct Inner {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    state: Mutex<ConnectionState>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    stats: Arc<ConnectionStats>,
    // Populated immediately after the connection task is spawned (the reactor only
    // hands back the guard once it knows which worker took the task).
    _load_guard: Mutex<Option<LoadGuard>>,
}

/// A cheap, cloneable handle to one non-blocking connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn bytes_in(&self) -> u64 {
        self.inner.stats.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.inner.stats.bytes_out.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.stats.queue_depth.load(Ordering::Relaxed)
    }

    /// Enqueues `chain` for transmission; FIFO with every other write enqueued on this
    /// connection. The
    /// returned future resolves once the chain has been fully written, or with a
    /// "connection closed" lifecycle fault if the connection closes first.
    pub async fn write(&self, chain: BlockChain) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Write(chain, tx)).is_err() {
            return Err(connection_closed());
        }
        rx.await.unwrap_or_else(|_| Err(connection_closed()))
    }

    /// Graceful close: stop accepting new writes, drain the queue bounded
    /// by `timeout`, then close the socket. Resolves once closed or the timeout
    /// elapses.
    pub async fn close(&self, timeout: Duration) {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::CloseGraceful(timeout, Some(tx))).is_ok() {
            let _ = rx.await;
        }
        *self.inner.state.lock() = ConnectionState::Closed;
    }

    /// Schedules a graceful close with `timeout = 0` and returns immediately.
    pub fn close_async(&self) {
        let _ = self.inner.commands.send(Command::CloseGraceful(Duration::ZERO, None));
    }
}

fn connection_closed() -> CoreError {
    CoreError::new(codes::NET_CONNECTION_CLOSED, ErrorCategory::Lifecycle, "connection closed")
}

/// Wires a freshly accepted or connected socket into a running connection task, and
/// returns the handle used to enqueue writes and observe state.
pub(crate) fn spawn_connection(
    id: ConnectionId,
    stream: TcpStream,
    pool: BlockPool,
    sink: Box<dyn MessageSink>,
    transform: Arc<dyn BufferTransform>,
    events: mpsc::Sender<crate::event::ManagerEvent>,
    reactor: &Reactor,
) -> Connection {
    let peer_addr = stream.peer_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
    let local_addr = stream.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let stats = Arc::new(ConnectionStats::default());

    let inner = Arc::new(Inner {
        id,
        commands: commands_tx.clone(),
        state: Mutex::new(ConnectionState::Connecting),
        peer_addr,
        local_addr,
        stats: stats.clone(),
        _load_guard: Mutex::new(None),
    });

    let (read_half, write_half) = stream.into_split();
    let task = run_connection(
        id,
        read_half,
        write_half,
        pool,
        sink,
        transform,
        commands_tx,
        commands_rx,
        events,
        inner.clone(),
        stats,
    );
    let load_guard = reactor.spawn(task);
    *inner._load_guard.lock() = Some(load_guard);

    Connection { inner }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    id: ConnectionId,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    pool: BlockPool,
    sink: Box<dyn MessageSink>,
    transform: Arc<dyn BufferTransform>,
    self_commands: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<crate::event::ManagerEvent>,
    inner: Arc<Inner>,
    stats: Arc<ConnectionStats>,
) {
    *inner.state.lock() = ConnectionState::Open;
    send_event(&events, id, crate::event::ConnectionEvent::Connected);

    let read_fut = read_loop(id, read_half, pool, sink, transform.clone(), events.clone(), self_commands, stats.clone());
    let write_fut = write_loop(write_half, commands_rx, transform, stats);

    tokio::join!(read_fut, write_fut);

    *inner.state.lock() = ConnectionState::Closed;
    send_event(&events, id, crate::event::ConnectionEvent::Closed);
}

fn send_event(
    events: &mpsc::Sender<crate::event::ManagerEvent>,
    connection_id: ConnectionId,
    event: crate::event::ConnectionEvent,
) {
    if events.try_send(crate::event::ManagerEvent { connection_id, event }).is_err() {
        debug!(?connection_id, "dropped connection event: dispatch channel full or closed");
    }
}

async fn read_loop(
    id: ConnectionId,
    mut read_half: OwnedReadHalf,
    pool: BlockPool,
    mut sink: Box<dyn MessageSink>,
    transform: Arc<dyn BufferTransform>,
    events: mpsc::Sender<crate::event::ManagerEvent>,
    self_commands: mpsc::UnboundedSender<Command>,
    stats: Arc<ConnectionStats>,
) {
    let mut accumulator = Accumulator::new(pool.clone());
    loop {
        if pool.cap() != 0 && pool.statistics().referenced >= pool.cap() {
            // Back-pressure : the pool is saturated, so we stop trying to
            // acquire further blocks until pressure subsides instead of busy-reading
            // into an ever-growing backlog.
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        }

        let mut scratch = match pool.acquire(8 * 1024) {
            Ok(block) => block,
            Err(_) => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
        };

        match read_half.read_buf(scratch.writable_storage()).await {
            Ok(0) => {
                send_event(&events, id, crate::event::ConnectionEvent::Eof);
                begin_self_close(&self_commands);
                break;
            }
            Ok(n) => {
                stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                scratch.freeze();
                let raw = BlockChain::from_iter(std::iter::once(scratch));
                let transformed = match transform.wrap_read(raw) {
                    Ok(chain) => chain,
                    Err(err) => {
                        send_event(&events, id, crate::event::ConnectionEvent::Error(err));
                        begin_self_close(&self_commands);
                        break;
                    }
                };
                match accumulator.feed(&transformed) {
                    Ok(messages) => {
                        for message in messages {
                            sink.on_message(message.message_type, message.session_id, message.chain);
                        }
                    }
                    Err(err) => {
                        send_event(&events, id, crate::event::ConnectionEvent::Error(err));
                        begin_self_close(&self_commands);
                        break;
                    }
                }
            }
            Err(io_err) => {
                let err = CoreError::io(codes::NET_READ, io_err);
                send_event(&events, id, crate::event::ConnectionEvent::Error(err));
                begin_self_close(&self_commands);
                break;
            }
        }
    }
}

fn begin_self_close(self_commands: &mpsc::UnboundedSender<Command>) {
    let _ = self_commands.send(Command::CloseGraceful(Duration::ZERO, None));
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<Command>,
    transform: Arc<dyn BufferTransform>,
    stats: Arc<ConnectionStats>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Write(chain, completion) => {
                stats.queue_depth.fetch_add(1, Ordering::Relaxed);
                let result = write_chain(&mut write_half, chain, &transform, &stats).await;
                stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                let failed = result.is_err();
                let _ = completion.send(result);
                if failed {
                    break;
                }
            }
            Command::CloseGraceful(timeout, done) => {
                drain_bounded(&mut write_half, &mut commands, &transform, &stats, timeout).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
                break;
            }
        }
    }
    fail_remaining(&mut commands);
}

async fn drain_bounded(
    write_half: &mut OwnedWriteHalf,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    transform: &Arc<dyn BufferTransform>,
    stats: &Arc<ConnectionStats>,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, commands.recv()).await;
        match next {
            Ok(Some(Command::Write(chain, completion))) => {
                let result = write_chain(write_half, chain, transform, stats).await;
                let _ = completion.send(result);
            }
            Ok(Some(Command::CloseGraceful(_, done))) => {
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

fn fail_remaining(commands: &mut mpsc::UnboundedReceiver<Command>) {
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Command::Write(_, completion) = command {
            let _ = completion.send(Err(connection_closed()));
        }
    }
}

async fn write_chain(
    write_half: &mut OwnedWriteHalf,
    chain: BlockChain,
    transform: &Arc<dyn BufferTransform>,
    stats: &Arc<ConnectionStats>,
) -> Result<()> {
    let chain = transform.wrap_write(chain)?;
    for block in chain {
        let bytes = block.as_slice();
        write_half
            .write_all(bytes)
            .await
            .map_err(|err| CoreError::io(codes::NET_WRITE, err))?;
        stats.bytes_out.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }
    Ok(())
}
