/// Host liveness monitoring
///
/// Each monitored endpoint gets one probe task, shared by every logical
/// connection interested in that host and kept alive by a reference
/// count. The task opens its own probe connection, pings on a fixed
/// interval, and publishes health transitions on a watch channel so an
/// in-flight operation can react to a death without waiting for its own
/// call to fail.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::core::conn::{ConnectionFactory, PhysicalConnection};
use crate::core::{Endpoint, HostInfo};

/// Probe-derived liveness of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostHealth {
    /// The last probe succeeded
    Alive,
    /// Probes are failing but the failure threshold is not reached yet
    Suspect,
    /// The failure threshold was reached; cleared by the next good probe
    Dead,
}

impl fmt::Display for HostHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostHealth::Alive => write!(f, "ALIVE"),
            HostHealth::Suspect => write!(f, "SUSPECT"),
            HostHealth::Dead => write!(f, "DEAD"),
        }
    }
}

/// Registry of probe tasks, one per monitored endpoint
pub struct MonitorRegistry {
    config: MonitorConfig,
    factory: Arc<dyn ConnectionFactory>,
    records: std::sync::RwLock<HashMap<Endpoint, Arc<MonitorRecord>>>,
}

struct MonitorRecord {
    host: HostInfo,
    health_tx: watch::Sender<HostHealth>,
    consecutive_failures: AtomicU32,
    refs: AtomicUsize,
    shutdown: Notify,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MonitorRecord {
    fn new(host: HostInfo) -> Self {
        let (health_tx, _) = watch::channel(HostHealth::Alive);
        Self {
            host,
            health_tx,
            consecutive_failures: AtomicU32::new(0),
            refs: AtomicUsize::new(0),
            shutdown: Notify::new(),
            task: std::sync::Mutex::new(None),
        }
    }
}

impl MonitorRegistry {
    pub fn new(config: MonitorConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            records: std::sync::RwLock::new(HashMap::new()),
        })
    }

    /// Claim the probe task for a host, starting it on first use.
    ///
    /// Every clone of interest takes its own lease; the task stops when
    /// the last lease is dropped.
    pub fn monitor(self: &Arc<Self>, host: &HostInfo) -> MonitorLease {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        let record = match records.get(&host.endpoint) {
            Some(existing) => existing.clone(),
            None => {
                let record = Arc::new(MonitorRecord::new(host.clone()));
                records.insert(host.endpoint.clone(), record.clone());
                self.start_probe(&record);
                record
            }
        };
        record.refs.fetch_add(1, Ordering::AcqRel);
        drop(records);

        MonitorLease {
            registry: self.clone(),
            endpoint: host.endpoint.clone(),
            record,
        }
    }

    /// Current health of an endpoint, if someone is monitoring it
    pub fn health_of(&self, endpoint: &Endpoint) -> Option<HostHealth> {
        let records = self.records.read().unwrap_or_else(|p| p.into_inner());
        records.get(endpoint).map(|r| *r.health_tx.borrow())
    }

    /// Number of endpoints with a live probe task
    pub fn active_count(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|p| p.into_inner());
        records.len()
    }

    /// Stop every probe task and drop all records. Leases still held
    /// release against the drained map with no effect.
    pub fn shutdown_all(&self) {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        for (endpoint, record) in records.drain() {
            record.shutdown.notify_one();
            if let Ok(mut slot) = record.task.lock() {
                if let Some(handle) = slot.take() {
                    handle.abort();
                }
            }
            debug!("Stopped host monitor for {} at shutdown", endpoint);
        }
    }

    fn release(&self, endpoint: &Endpoint, record: &Arc<MonitorRecord>) {
        if record.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        if record.refs.load(Ordering::Acquire) != 0 {
            // Re-leased between the decrement and taking the lock
            return;
        }
        if let Some(current) = records.get(endpoint) {
            if Arc::ptr_eq(current, record) {
                records.remove(endpoint);
            }
        }
        drop(records);

        record.shutdown.notify_one();
        if let Ok(mut slot) = record.task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        debug!("Stopped host monitor for {}", endpoint);
    }

    fn start_probe(self: &Arc<Self>, record: &Arc<MonitorRecord>) {
        let registry = Arc::clone(self);
        let probe_record = Arc::clone(record);
        let handle = tokio::spawn(async move {
            registry.probe_loop(probe_record).await;
        });
        if let Ok(mut slot) = record.task.lock() {
            *slot = Some(handle);
        }
        debug!(
            "Started host monitor for {} (interval {:?}, timeout {:?})",
            record.host.endpoint,
            self.config.probe_interval(),
            self.config.probe_timeout()
        );
    }

    async fn probe_loop(&self, record: Arc<MonitorRecord>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut conn: Option<Box<dyn PhysicalConnection>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let healthy = self.probe_once(&record, &mut conn).await;
                    self.apply_result(&record, healthy);
                }
                _ = record.shutdown.notified() => break,
            }
        }

        if let Some(mut c) = conn.take() {
            let _ = c.close().await;
        }
        debug!("Host monitor loop for {} exited", record.host.endpoint);
    }

    /// One probe: reconnect if needed, then ping. A single timeout spans
    /// both steps so a hung connect counts the same as a hung ping.
    async fn probe_once(
        &self,
        record: &MonitorRecord,
        conn: &mut Option<Box<dyn PhysicalConnection>>,
    ) -> bool {
        let attempt = async {
            if let Some(c) = conn.as_mut() {
                return c.ping().await;
            }
            let mut fresh = self.factory.connect(&record.host).await?;
            fresh.ping().await?;
            *conn = Some(fresh);
            Ok(())
        };

        let healthy = matches!(
            tokio::time::timeout(self.config.probe_timeout(), attempt).await,
            Ok(Ok(()))
        );
        if !healthy {
            // The probe connection is unusable after a failure
            *conn = None;
        }
        healthy
    }

    fn apply_result(&self, record: &MonitorRecord, healthy: bool) {
        if healthy {
            record.consecutive_failures.store(0, Ordering::Release);
            self.transition(record, HostHealth::Alive);
        } else {
            let failures = record.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            let next = if failures >= self.config.failure_threshold {
                HostHealth::Dead
            } else {
                HostHealth::Suspect
            };
            self.transition(record, next);
        }
    }

    fn transition(&self, record: &MonitorRecord, next: HostHealth) {
        let mut previous = None;
        record.health_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                previous = Some(*current);
                *current = next;
                true
            }
        });

        if let Some(previous) = previous {
            match next {
                HostHealth::Dead => warn!(
                    "Host {} is DEAD after {} consecutive probe failures",
                    record.host.endpoint, self.config.failure_threshold
                ),
                HostHealth::Suspect => info!(
                    "Host {} is SUSPECT (was {})",
                    record.host.endpoint, previous
                ),
                HostHealth::Alive => info!(
                    "Host {} is ALIVE (was {})",
                    record.host.endpoint, previous
                ),
            }
        }
    }
}

/// RAII claim on a host's probe task.
///
/// Dropping the last lease for an endpoint stops the probe task and
/// removes its record from the registry.
pub struct MonitorLease {
    registry: Arc<MonitorRegistry>,
    endpoint: Endpoint,
    record: Arc<MonitorRecord>,
}

impl MonitorLease {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Health as of the last completed probe
    pub fn health(&self) -> HostHealth {
        *self.record.health_tx.borrow()
    }

    /// Watch health transitions for this endpoint
    pub fn subscribe(&self) -> watch::Receiver<HostHealth> {
        self.record.health_tx.subscribe()
    }
}

impl Drop for MonitorLease {
    fn drop(&mut self) {
        self.registry.release(&self.endpoint, &self.record);
    }
}
