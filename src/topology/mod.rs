/// Topology discovery and caching
///
/// One `TopologyService` is shared by every logical connection the driver
/// hands out. Reads are cheap `Arc` snapshots of the last committed
/// topology. Refreshes funnel through a per-cluster gate so concurrent
/// callers collapse onto a single membership query, and every commit
/// carries a version strictly greater than the one before it.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::TopologyConfig;
use crate::core::conn::{ConnectionFactory, MemberRecord, TopologySource};
use crate::core::{ClusterId, Endpoint, HostInfo, HostRole, Topology};
use crate::error::{EngineError, RelevoError, RelevoResult};
use crate::utils::backoff_delay;

/// Shared topology discovery service
pub struct TopologyService {
    config: TopologyConfig,
    factory: Arc<dyn ConnectionFactory>,
    source: Arc<dyn TopologySource>,
    clusters: RwLock<HashMap<ClusterId, Arc<ClusterEntry>>>,
}

/// Per-cluster cache state
struct ClusterEntry {
    cluster: ClusterId,
    seeds: Vec<HostInfo>,
    cached: RwLock<Option<Arc<Topology>>>,
    committed_version: AtomicU64,
    refresh_gate: Mutex<()>,
    refreshing: AtomicBool,
    refs: AtomicUsize,
    shutdown: Notify,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClusterEntry {
    fn new(cluster: ClusterId, seeds: &[Endpoint]) -> Self {
        let seeds = seeds
            .iter()
            .map(|e| HostInfo::new(e.clone(), HostRole::Unknown))
            .collect();
        Self {
            cluster,
            seeds,
            cached: RwLock::new(None),
            committed_version: AtomicU64::new(0),
            refresh_gate: Mutex::new(()),
            refreshing: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
            shutdown: Notify::new(),
            task: std::sync::Mutex::new(None),
        }
    }

    async fn cached(&self) -> Option<Arc<Topology>> {
        self.cached.read().await.clone()
    }

    /// Install a committed snapshot. Versions at or below the current one
    /// are rejected so a slow refresh can never roll the cache back.
    async fn install(&self, topo: Arc<Topology>) -> bool {
        let mut cached = self.cached.write().await;
        let current = self.committed_version.load(Ordering::Acquire);
        if topo.version() <= current {
            debug!(
                "Discarding topology v{} for cluster '{}': v{} already committed",
                topo.version(),
                self.cluster,
                current
            );
            return false;
        }
        self.committed_version.store(topo.version(), Ordering::Release);
        *cached = Some(topo);
        true
    }

    /// Hosts worth asking for membership: the committed topology first,
    /// then any configured seed not already in it
    async fn candidates(&self) -> Vec<HostInfo> {
        let mut list: Vec<HostInfo> = match self.cached().await {
            Some(topo) => topo.hosts().to_vec(),
            None => Vec::new(),
        };
        for seed in &self.seeds {
            if !list.iter().any(|h| h.endpoint == seed.endpoint) {
                list.push(seed.clone());
            }
        }
        list
    }
}

impl TopologyService {
    pub fn new(
        config: TopologyConfig,
        factory: Arc<dyn ConnectionFactory>,
        source: Arc<dyn TopologySource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            source,
            clusters: RwLock::new(HashMap::new()),
        })
    }

    async fn register(&self, cluster: &ClusterId, seeds: &[Endpoint]) -> Arc<ClusterEntry> {
        if let Some(entry) = self.clusters.read().await.get(cluster) {
            return entry.clone();
        }
        let mut clusters = self.clusters.write().await;
        clusters
            .entry(cluster.clone())
            .or_insert_with(|| Arc::new(ClusterEntry::new(cluster.clone(), seeds)))
            .clone()
    }

    async fn entry(&self, cluster: &ClusterId) -> RelevoResult<Arc<ClusterEntry>> {
        self.clusters
            .read()
            .await
            .get(cluster)
            .cloned()
            .ok_or_else(|| RelevoError::topology_query(cluster.clone(), "cluster is not registered"))
    }

    /// Last committed snapshot, with no freshness check
    pub async fn cached(&self, cluster: &ClusterId) -> Option<Arc<Topology>> {
        let entry = self.clusters.read().await.get(cluster).cloned();
        match entry {
            Some(entry) => entry.cached().await,
            None => None,
        }
    }

    /// Version of the last committed snapshot, 0 before the first commit
    pub async fn committed_version(&self, cluster: &ClusterId) -> u64 {
        match self.entry(cluster).await {
            Ok(entry) => entry.committed_version.load(Ordering::Acquire),
            Err(_) => 0,
        }
    }

    /// Snapshot for callers. The first call for a cluster populates the
    /// cache synchronously; afterwards callers get the cached copy, and a
    /// copy older than the staleness threshold additionally kicks off a
    /// background refresh.
    pub async fn snapshot(self: &Arc<Self>, cluster: &ClusterId) -> RelevoResult<Arc<Topology>> {
        let entry = self.entry(cluster).await?;
        if let Some(topo) = entry.cached().await {
            let age = topo.created_at().elapsed().unwrap_or_default();
            if age >= self.config.staleness_threshold() {
                self.spawn_refresh(entry);
            }
            return Ok(topo);
        }
        self.refresh_entry(&entry).await
    }

    /// Kick off a background refresh when the cached snapshot has gone
    /// stale. Returns without waiting either way.
    pub async fn ensure_fresh(self: &Arc<Self>, cluster: &ClusterId) {
        let entry = match self.clusters.read().await.get(cluster).cloned() {
            Some(entry) => entry,
            None => return,
        };
        let stale = match entry.cached().await {
            Some(topo) => {
                topo.created_at().elapsed().unwrap_or_default() >= self.config.staleness_threshold()
            }
            None => true,
        };
        if stale {
            self.spawn_refresh(entry);
        }
    }

    /// Force a refresh and return the resulting snapshot
    pub async fn refresh(&self, cluster: &ClusterId) -> RelevoResult<Arc<Topology>> {
        let entry = self.entry(cluster).await?;
        self.refresh_entry(&entry).await
    }

    /// Request a background refresh right away, collapsing into any
    /// already in flight
    pub async fn refresh_soon(self: &Arc<Self>, cluster: &ClusterId) {
        if let Some(entry) = self.clusters.read().await.get(cluster).cloned() {
            self.spawn_refresh(entry);
        }
    }

    /// Hosts to try when opening a connection, preferring the committed
    /// topology over raw seeds
    pub async fn connect_candidates(&self, cluster: &ClusterId) -> Vec<HostInfo> {
        match self.entry(cluster).await {
            Ok(entry) => entry.candidates().await,
            Err(_) => Vec::new(),
        }
    }

    /// Keep the cluster registered and its periodic refresh running.
    ///
    /// The first lease for a cluster starts the refresh task and dropping
    /// the last one stops it. The cached topology outlives the leases, so
    /// a later connection starts from the last committed snapshot.
    pub async fn lease(self: &Arc<Self>, cluster: &ClusterId, seeds: &[Endpoint]) -> RefreshLease {
        let entry = self.register(cluster, seeds).await;
        if entry.refs.fetch_add(1, Ordering::AcqRel) == 0 {
            self.start_periodic(&entry);
        }
        RefreshLease { entry }
    }

    /// Drop every cluster entry and stop its refresh task. Leases still
    /// held by open connections release against the drained map with no
    /// effect.
    pub async fn shutdown_all(&self) {
        let mut clusters = self.clusters.write().await;
        for (cluster, entry) in clusters.drain() {
            entry.shutdown.notify_one();
            if let Ok(mut slot) = entry.task.lock() {
                if let Some(handle) = slot.take() {
                    handle.abort();
                }
            }
            debug!("Dropped topology cache for cluster '{}'", cluster);
        }
    }

    async fn refresh_entry(&self, entry: &Arc<ClusterEntry>) -> RelevoResult<Arc<Topology>> {
        let observed = entry.committed_version.load(Ordering::Acquire);
        let _gate = entry.refresh_gate.lock().await;

        // A refresh that finished while we waited on the gate already
        // produced a snapshot newer than what this caller saw.
        if entry.committed_version.load(Ordering::Acquire) > observed {
            if let Some(topo) = entry.cached().await {
                return Ok(topo);
            }
        }

        self.query_and_commit(entry).await
    }

    async fn query_and_commit(&self, entry: &Arc<ClusterEntry>) -> RelevoResult<Arc<Topology>> {
        let candidates = entry.candidates().await;
        if candidates.is_empty() {
            return Err(RelevoError::topology_query(
                entry.cluster.clone(),
                "no candidate hosts to query",
            ));
        }

        let mut last_error = String::new();
        for pass in 0..self.config.refresh_retry_passes {
            if pass > 0 {
                let delay = backoff_delay(
                    self.config.refresh_backoff(),
                    pass - 1,
                    self.config.refresh_backoff() * 8,
                );
                tokio::time::sleep(delay).await;
            }
            for host in &candidates {
                match self.query_host(host).await {
                    Ok(members) => return Ok(self.commit(entry, members).await),
                    Err(e) => {
                        debug!("Membership query via {} failed: {}", host.endpoint, e);
                        last_error = e.to_string();
                    }
                }
            }
        }

        warn!(
            "Topology refresh for cluster '{}' failed on every candidate",
            entry.cluster
        );
        Err(RelevoError::topology_query(
            entry.cluster.clone(),
            if last_error.is_empty() {
                "no candidate host answered".to_string()
            } else {
                last_error
            },
        ))
    }

    /// Query one host for the member list, bounded by the query timeout
    async fn query_host(&self, host: &HostInfo) -> Result<Vec<MemberRecord>, EngineError> {
        let query = async {
            let mut conn = self.factory.connect(host).await?;
            let members = self.source.fetch_members(conn.as_mut()).await;
            let _ = conn.close().await;
            members
        };
        match tokio::time::timeout(self.config.query_timeout(), query).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(self.config.query_timeout())),
        }
    }

    async fn commit(&self, entry: &Arc<ClusterEntry>, members: Vec<MemberRecord>) -> Arc<Topology> {
        // Callers hold the refresh gate, so the +1 cannot collide.
        let version = entry.committed_version.load(Ordering::Acquire) + 1;
        let topo = Arc::new(Topology::from_members(entry.cluster.clone(), version, members));
        entry.install(topo.clone()).await;
        info!(
            "Committed topology v{} for cluster '{}': {} hosts, writer {}",
            topo.version(),
            entry.cluster,
            topo.len(),
            topo.writer()
                .map(|w| w.endpoint.to_string())
                .unwrap_or_else(|| "none".to_string()),
        );
        topo
    }

    /// Refresh in the background, at most one in flight per cluster
    fn spawn_refresh(self: &Arc<Self>, entry: Arc<ClusterEntry>) {
        if entry
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.refresh_entry(&entry).await {
                debug!(
                    "Background topology refresh for cluster '{}' failed: {}",
                    entry.cluster, e
                );
            }
            entry.refreshing.store(false, Ordering::Release);
        });
    }

    fn start_periodic(self: &Arc<Self>, entry: &Arc<ClusterEntry>) {
        let service = Arc::clone(self);
        let entry_task = Arc::clone(entry);
        let period = self.config.refresh_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the connect path has
            // already primed the cache, so consume it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.refresh_entry(&entry_task).await {
                            warn!(
                                "Periodic topology refresh for cluster '{}' failed: {}",
                                entry_task.cluster, e
                            );
                        }
                    }
                    _ = entry_task.shutdown.notified() => break,
                }
            }
            debug!(
                "Topology refresh task for cluster '{}' stopped",
                entry_task.cluster
            );
        });
        if let Ok(mut slot) = entry.task.lock() {
            *slot = Some(handle);
        }
        debug!(
            "Started periodic topology refresh for cluster '{}' every {:?}",
            entry.cluster, period
        );
    }
}

/// RAII handle keeping periodic refresh alive for one logical connection
pub struct RefreshLease {
    entry: Arc<ClusterEntry>,
}

impl Drop for RefreshLease {
    fn drop(&mut self) {
        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.entry.shutdown.notify_one();
            if let Ok(mut slot) = self.entry.task.lock() {
                if let Some(handle) = slot.take() {
                    handle.abort();
                }
            }
            debug!(
                "Stopped periodic topology refresh for cluster '{}'",
                self.entry.cluster
            );
        }
    }
}
