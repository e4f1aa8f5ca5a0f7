//! # Connection Registry & Scheduler
//!
//! Two concurrent maps of live connections (clients and servers) plus the
//! five background workers that service them:
//!
//! | Worker            | Scope   | Tick              |
//! |-------------------|---------|-------------------|
//! | connection-check  | all     | liveness interval |
//! | counter           | all     | 1 s               |
//! | send              | all     | 1 ms              |
//! | client-receive    | clients | 1 ms              |
//! | server-receive    | servers | 1 ms              |
//!
//! Workers start when the first connection registers and stop when the
//! last one leaves. Both transitions happen under one lifecycle lock, so
//! the workers run exactly while the registry is populated.
//!
//! Each tick sweeps a snapshot of the worker's scope. A connection that
//! closed after the snapshot was taken is skipped. An error or panic while
//! servicing one connection goes to that connection's error channel and
//! the sweep moves on.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{NetworkConfig, DEFAULT_CONNECTION_TIMEOUT};
use crate::error::{constants, ProtocolError, Result};
use crate::transport::connection::{Connection, ConnectionId, Role};
use crate::utils::metrics::Metrics;

const HOT_TICK: Duration = Duration::from_millis(1);
const COUNTER_TICK: Duration = Duration::from_secs(1);

/// The fixed set of scheduler loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Worker {
    ConnectionCheck,
    Counter,
    Send,
    ClientReceive,
    ServerReceive,
}

impl Worker {
    pub const ALL: [Worker; 5] = [
        Worker::ConnectionCheck,
        Worker::Counter,
        Worker::Send,
        Worker::ClientReceive,
        Worker::ServerReceive,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Worker::ConnectionCheck => "connection-check",
            Worker::Counter => "counter",
            Worker::Send => "send",
            Worker::ClientReceive => "client-receive",
            Worker::ServerReceive => "server-receive",
        }
    }

    fn interval(self, liveness: Duration) -> Duration {
        match self {
            Worker::ConnectionCheck => liveness,
            Worker::Counter => COUNTER_TICK,
            Worker::Send | Worker::ClientReceive | Worker::ServerReceive => HOT_TICK,
        }
    }

    fn snapshot(self, registry: &Registry) -> Vec<Connection> {
        let collect = |map: &DashMap<ConnectionId, Connection>| {
            map.iter().map(|entry| entry.value().clone()).collect::<Vec<_>>()
        };
        match self {
            Worker::ClientReceive => collect(&registry.clients),
            Worker::ServerReceive => collect(&registry.servers),
            _ => {
                let mut all = collect(&registry.clients);
                all.extend(collect(&registry.servers));
                all
            }
        }
    }

    fn service(self, conn: &Connection) -> Result<()> {
        match self {
            Worker::ConnectionCheck => conn.check_liveness(),
            Worker::Counter => {
                conn.roll_counters();
                Ok(())
            }
            Worker::Send => conn.drain_send(),
            Worker::ClientReceive | Worker::ServerReceive => conn.drain_receive(),
        }
    }

    async fn run(self, registry: Weak<Registry>, token: CancellationToken, interval: Duration) {
        debug!(worker = self.name(), "Scheduler worker started");
        loop {
            let Some(live) = registry.upgrade() else {
                break;
            };
            let connections = self.snapshot(&live);
            drop(live);

            for conn in connections {
                if token.is_cancelled() {
                    break;
                }
                if conn.is_closed() {
                    continue;
                }
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    if let Err(e) = self.service(&conn) {
                        conn.fail(e);
                    }
                }));
                if let Err(panic) = outcome {
                    let message = panic_message(&*panic);
                    error!(worker = self.name(), conn = conn.id(), %message, "Panic while servicing connection");
                    let _ = catch_unwind(AssertUnwindSafe(|| {
                        conn.fail(ProtocolError::Custom(format!(
                            "panic in {} worker: {message}",
                            self.name()
                        )))
                    }));
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!(worker = self.name(), "Scheduler worker stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Workers {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Live connections and the workers servicing them.
pub struct Registry {
    clients: DashMap<ConnectionId, Connection>,
    servers: DashMap<ConnectionId, Connection>,
    lifecycle: Mutex<Option<Workers>>,
    next_id: AtomicU64,
    liveness_interval: Duration,
    metrics: Arc<Metrics>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Self::with_liveness_interval(DEFAULT_CONNECTION_TIMEOUT)
    }

    pub fn with_liveness_interval(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            servers: DashMap::new(),
            lifecycle: Mutex::new(None),
            next_id: AtomicU64::new(1),
            liveness_interval: interval,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn from_config(config: &NetworkConfig) -> Arc<Self> {
        Self::with_liveness_interval(config.transport.connection_timeout)
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn liveness_interval(&self) -> Duration {
        self.liveness_interval
    }

    /// Insert `conn`; the first registration starts the workers.
    pub fn register(self: &Arc<Self>, conn: Connection) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_none() {
            *lifecycle = Some(self.start_workers()?);
        }

        let id = conn.id();
        let role = conn.role();
        match role {
            Role::Client => self.clients.insert(id, conn),
            Role::Server => self.servers.insert(id, conn),
        };
        self.metrics.connection_registered();
        debug!(conn = id, ?role, "Connection registered");
        Ok(())
    }

    /// Remove `id`; when both maps are empty the workers stop.
    pub fn unregister(&self, id: ConnectionId) -> Option<Connection> {
        let mut lifecycle = self.lifecycle.lock();
        let removed = self
            .clients
            .remove(&id)
            .or_else(|| self.servers.remove(&id))
            .map(|(_, conn)| conn);
        if removed.is_some() {
            self.metrics.connection_unregistered();
            debug!(conn = id, "Connection unregistered");
        }

        if self.clients.is_empty() && self.servers.is_empty() {
            if let Some(workers) = lifecycle.take() {
                workers.stop();
                info!("Registry empty, scheduler stopped");
            }
        }
        removed
    }

    fn start_workers(self: &Arc<Self>) -> Result<Workers> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ProtocolError::Custom(constants::ERR_SCHEDULER_RUNTIME.to_string())
        })?;
        let token = CancellationToken::new();
        let handles = Worker::ALL
            .iter()
            .map(|&worker| {
                runtime.spawn(worker.run(
                    Arc::downgrade(self),
                    token.clone(),
                    worker.interval(self.liveness_interval),
                ))
            })
            .collect();
        info!(workers = Worker::ALL.len(), "Scheduler started");
        Ok(Workers { token, handles })
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.clients
            .get(&id)
            .or_else(|| self.servers.get(&id))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len() + self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.servers.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Every registered connection.
    pub fn connections(&self) -> Vec<Connection> {
        Worker::Send.snapshot(self)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().is_some()
    }

    /// Number of live worker tasks.
    pub fn worker_count(&self) -> usize {
        self.lifecycle
            .lock()
            .as_ref()
            .map_or(0, |w| w.handles.iter().filter(|h| !h.is_finished()).count())
    }

    /// Close every connection; the workers stop with the last one.
    pub fn close_all(&self) {
        for conn in self.connections() {
            conn.close();
        }
    }
}
