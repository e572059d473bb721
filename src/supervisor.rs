//! Worker supervision and the permit pool.
//!
//! The supervisor keeps a fixed population of workers alive, one independent
//! replenishment loop per slot, and feeds their permits into a bounded pool.
//! The pool is the single source of admission: each permit grants the right
//! to forward exactly one request to a specific worker, so at most
//! `workers * concurrency` requests are ever in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::port::alloc_port;
use crate::worker::Worker;

/// Placeholder token replaced by the worker's port in command arguments.
pub const PORT_TOKEN: &str = "{{.Port}}";

const PORT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pause after discarding a dead-worker permit, so the remaining permits of
/// a just-killed worker are not spun through before its replacement has
/// published anything.
const DEAD_PERMIT_BACKOFF: Duration = Duration::from_millis(50);

pub struct Supervisor {
    command: String,
    args: Vec<String>,
    concurrency: usize,
    pool_tx: mpsc::Sender<Arc<Worker>>,
    /// Receiver shared by all dispatch tasks; the mutex keeps the draw FIFO.
    pool_rx: Mutex<mpsc::Receiver<Arc<Worker>>>,
    /// Port to current worker. Writer on install/replace, readers on dispatch
    /// post-processing. Entries are replaced wholesale, never mutated.
    worker_by_port: RwLock<HashMap<u16, Arc<Worker>>>,
}

impl Supervisor {
    /// Creates a supervisor for `workers` subprocesses of `command` with
    /// `concurrency` permits each. The permit pool is bounded at
    /// `workers * concurrency`.
    pub fn new(
        command: String,
        args: Vec<String>,
        workers: usize,
        concurrency: usize,
    ) -> Arc<Self> {
        let (pool_tx, pool_rx) = mpsc::channel(workers.max(1) * concurrency.max(1));
        Arc::new(Self {
            command,
            args,
            concurrency,
            pool_tx,
            pool_rx: Mutex::new(pool_rx),
            worker_by_port: RwLock::new(HashMap::new()),
        })
    }

    /// Ensures `n` workers are always alive. Each slot runs an independent
    /// replenishment loop: allocate a port, spawn, publish permits, wait for
    /// death, repeat. A worker's restart never cascades to its siblings.
    pub fn ensure_workers(self: &Arc<Self>, n: usize) {
        info!(command = %self.command_line(), count = n, "ensuring workers");
        for _ in 0..n {
            let sup = Arc::clone(self);
            tokio::spawn(async move { sup.run_slot().await });
        }
    }

    async fn run_slot(self: Arc<Self>) {
        loop {
            let port = match alloc_port() {
                Ok(port) => port,
                Err(e) => {
                    warn!(error = %e, "failed to find free port");
                    tokio::time::sleep(PORT_RETRY_DELAY).await;
                    continue;
                }
            };

            let args = template_args(&self.args, port);
            let worker = Worker::spawn(port, &self.command, &args);
            self.worker_by_port
                .write()
                .insert(port, Arc::clone(&worker));

            self.publish_permits(&worker).await;
            worker.done().await;

            // Drop the index entry unless a replacement already took the
            // port; stale permits in the pool still reference the dead
            // worker and are filtered on acquire.
            {
                let mut index = self.worker_by_port.write();
                if index
                    .get(&port)
                    .is_some_and(|current| Arc::ptr_eq(current, &worker))
                {
                    index.remove(&port);
                }
            }
            debug!(port, pid = worker.pid, "worker slot vacated, respawning");
        }
    }

    /// Publishes up to `concurrency` permits for `worker`, honoring pool
    /// backpressure. Publication is abandoned as soon as the worker dies.
    async fn publish_permits(&self, worker: &Arc<Worker>) {
        for _ in 0..self.concurrency {
            tokio::select! {
                slot = self.pool_tx.reserve() => match slot {
                    Ok(slot) => slot.send(Arc::clone(worker)),
                    Err(_) => return,
                },
                _ = worker.done() => return,
            }
        }
    }

    /// Draws permits until one references a live worker. Permits whose worker
    /// has been cancelled or has exited are discarded with a short pause.
    pub async fn acquire(&self) -> Arc<Worker> {
        loop {
            let worker = {
                let mut rx = self.pool_rx.lock().await;
                rx.recv()
                    .await
                    .expect("pool sender lives as long as the supervisor")
            };
            if !worker.is_cancelled() && !worker.is_done() {
                return worker;
            }
            tokio::time::sleep(DEAD_PERMIT_BACKOFF).await;
        }
    }

    /// Returns a permit for `worker` to the pool without blocking the
    /// caller's response path. Permits for dead workers are fine to release;
    /// they are filtered on the next acquire.
    pub fn release(&self, worker: Arc<Worker>) {
        let tx = self.pool_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(worker).await;
        });
    }

    /// The worker currently installed at `port`, if any.
    pub fn worker_for_port(&self, port: u16) -> Option<Arc<Worker>> {
        self.worker_by_port.read().get(&port).cloned()
    }

    /// Kills every live worker. Used on shutdown.
    pub fn cancel_all(&self) {
        for worker in self.worker_by_port.read().values() {
            worker.cancel();
        }
    }

    fn command_line(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Replaces every `{{.Port}}` occurrence in each argument with the decimal
/// port. Idempotent: the substituted text contains no further tokens.
pub fn template_args(args: &[String], port: u16) -> Vec<String> {
    let port = port.to_string();
    args.iter()
        .map(|arg| arg.replace(PORT_TOKEN, &port))
        .collect()
}
