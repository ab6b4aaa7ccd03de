use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};

/// A fixed-size pool of I/O workers. `worker_count = 0` means "inline":
/// every connection's task is spawned on the ambient Tokio runtime the manager itself
/// is running on. Otherwise each worker is a dedicated single-threaded Tokio runtime
/// driven on its own OS thread, each acting as a dedicated selector thread — load
/// balancing happens once, at registration, and a connection is never migrated
/// afterward.
pub struct Reactor {
    workers: Vec<Worker>,
}

struct Worker {
    handle: Handle,
    /// Kept alive for the lifetime of the reactor; dropping it would shut the runtime
    /// down out from under any tasks still spawned on it.
    _runtime: Option<Runtime>,
    load: Arc<AtomicUsize>,
}

impl Reactor {
    pub fn new(worker_count: usize) -> Self {
        if worker_count == 0 {
            return Self {
                workers: vec![Worker {
                    handle: Handle::current(),
                    _runtime: None,
                    load: Arc::new(AtomicUsize::new(0)),
                }],
            };
        }

        let workers = (0..worker_count)
            .map(|index| {
                let runtime = Builder::new_current_thread()
                    .thread_name(format!("shardnet-worker-{index}"))
                    .enable_all()
                    .build()
                    .expect("failed to build a dedicated worker runtime");
                let handle = runtime.handle().clone();
                // Drive the current-thread runtime on its own OS thread; the runtime
                // otherwise only makes progress while something calls `block_on`.
                std::thread::Builder::new()
                    .name(format!("shardnet-worker-driver-{index}"))
                    .spawn({
                        let handle = handle.clone();
                        move || {
                            handle.block_on(std::future::pending::<()>());
                        }
                    })
                    .expect("failed to spawn worker driver thread");
                Worker {
                    handle,
                    _runtime: Some(runtime),
                    load: Arc::new(AtomicUsize::new(0)),
                }
            })
            .collect();
        Self { workers }
    }

    fn least_loaded_index(&self) -> usize {
        self.workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.load.load(Ordering::Relaxed))
            .map(|(i, _)| i)
            .expect("reactor always has at least one worker")
    }

    /// Spawns `fut` onto the least-loaded worker at this moment, permanently
    /// attributing its load to that worker. Returns the worker's load guard; the caller holds it for the
    /// lifetime of the connection and drops it when the connection closes.
    pub fn spawn<F>(&self, fut: F) -> LoadGuard
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let index = self.least_loaded_index();
        let worker = &self.workers[index];
        worker.load.fetch_add(1, Ordering::Relaxed);
        worker.handle.spawn(fut);
        LoadGuard {
            load: worker.load.clone(),
        }
    }

    pub fn worker_loads(&self) -> Vec<usize> {
        self.workers.iter().map(|w| w.load.load(Ordering::Relaxed)).collect()
    }
}

/// Decrements the owning worker's load counter on drop, so the reactor's
/// least-loaded-at-registration balancing reflects connections that have since
/// closed.
pub struct LoadGuard {
    load: Arc<AtomicUsize>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.load.fetch_sub(1, Ordering::Relaxed);
    }
}
