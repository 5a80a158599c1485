/// Logical connection: the caller-facing handle and its core
///
/// `ConnectionCore` owns everything one logical connection shares across
/// the pipeline: the physical connection slot, the bound host, recorded
/// session state, and the monitor and refresh leases. It is the terminal
/// stage of the plugin pipeline. `Connection` is the thin public handle
/// that sends every call through the pipeline.
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::conn::{
    ConnectionFactory, ExecuteOutcome, IsolationLevel, Operation, PhysicalConnection,
    SessionSetting,
};
use crate::core::session::SessionState;
use crate::core::{ClusterId, Endpoint, HostInfo, HostRole};
use crate::error::{EngineError, RelevoError, RelevoResult};
use crate::failover::{FailoverCoordinator, FailoverPhase};
use crate::monitor::{HostHealth, MonitorLease, MonitorRegistry};
use crate::pipeline::{OperationContext, Pipeline, PipelineTerminal};
use crate::topology::{RefreshLease, TopologyService};

/// What a session replay did on a fresh physical connection
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionReplay {
    pub applied: usize,
    pub skipped: usize,
}

/// Shared state of one logical connection
pub struct ConnectionCore {
    id: String,
    cluster: ClusterId,
    seeds: Vec<Endpoint>,
    target_role: HostRole,
    config: Arc<Config>,
    topology: Arc<TopologyService>,
    monitors: Arc<MonitorRegistry>,
    factory: Arc<dyn ConnectionFactory>,

    physical: Mutex<Option<Box<dyn PhysicalConnection>>>,
    bound: RwLock<Option<HostInfo>>,
    session: RwLock<SessionState>,
    monitor_lease: RwLock<Option<MonitorLease>>,
    refresh_lease: std::sync::Mutex<Option<RefreshLease>>,
    closed_tx: watch::Sender<bool>,
}

impl ConnectionCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        cluster: ClusterId,
        seeds: Vec<Endpoint>,
        target_role: HostRole,
        config: Arc<Config>,
        topology: Arc<TopologyService>,
        monitors: Arc<MonitorRegistry>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            cluster,
            seeds,
            target_role,
            config,
            topology,
            monitors,
            factory,
            physical: Mutex::new(None),
            bound: RwLock::new(None),
            session: RwLock::new(SessionState::default()),
            monitor_lease: RwLock::new(None),
            refresh_lease: std::sync::Mutex::new(None),
            closed_tx,
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn cluster(&self) -> &ClusterId {
        &self.cluster
    }

    pub(crate) fn target_role(&self) -> HostRole {
        self.target_role
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn topology(&self) -> &Arc<TopologyService> {
        &self.topology
    }

    pub(crate) fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves when the logical connection is closed
    pub(crate) async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) async fn bound_host(&self) -> Option<HostInfo> {
        self.bound.read().await.clone()
    }

    pub(crate) async fn bound_endpoint(&self) -> Option<Endpoint> {
        self.bound.read().await.as_ref().map(|h| h.endpoint.clone())
    }

    /// Health transitions of the bound host, while one is bound
    pub(crate) async fn dead_watch(&self) -> Option<(Endpoint, watch::Receiver<HostHealth>)> {
        self.monitor_lease
            .read()
            .await
            .as_ref()
            .map(|l| (l.endpoint().clone(), l.subscribe()))
    }

    pub(crate) async fn session_snapshot(&self) -> SessionState {
        self.session.read().await.clone()
    }

    /// Open the initial binding: prime the topology, walk candidates of
    /// the target role, bind the first host that answers.
    pub(crate) async fn establish_initial(&self) -> RelevoResult<HostInfo> {
        if self.is_closed() {
            return Err(RelevoError::ConnectionClosed);
        }

        let lease = self.topology.lease(&self.cluster, &self.seeds).await;
        if let Ok(mut slot) = self.refresh_lease.lock() {
            *slot = Some(lease);
        }

        let topo = self.topology.snapshot(&self.cluster).await?;
        let candidates = self.connect_candidates(topo.hosts());
        if candidates.is_empty() {
            return Err(RelevoError::no_available_host(
                self.cluster.clone(),
                self.target_role,
            ));
        }

        for host in candidates {
            match self.adopt(&host).await {
                Ok(_) => {
                    info!("[{}] bound to {}", self.id, host);
                    return Ok(host);
                }
                Err(e) => {
                    debug!("[{}] connect to {} failed: {}", self.id, host.endpoint, e);
                }
            }
        }

        Err(RelevoError::no_available_host(
            self.cluster.clone(),
            self.target_role,
        ))
    }

    /// Hosts worth trying for this connection's role, best first
    fn connect_candidates(&self, hosts: &[HostInfo]) -> Vec<HostInfo> {
        let writer = hosts.iter().find(|h| h.role.is_writer()).cloned();
        match self.target_role {
            HostRole::Writer => writer.into_iter().collect(),
            _ => {
                let mut readers: Vec<HostInfo> = hosts
                    .iter()
                    .filter(|h| h.role.is_reader())
                    .cloned()
                    .collect();
                readers.sort_by(|a, b| {
                    b.weight
                        .cmp(&a.weight)
                        .then_with(|| a.endpoint.cmp(&b.endpoint))
                });
                if readers.is_empty() {
                    // a writer can serve a reader connection
                    writer.into_iter().collect()
                } else {
                    readers
                }
            }
        }
    }

    /// Bind to `host`: open a physical connection, replay the recorded
    /// session onto it, and only then swap it in. A failure leaves the
    /// previous binding untouched.
    pub(crate) async fn adopt(&self, host: &HostInfo) -> Result<SessionReplay, EngineError> {
        let mut conn = self.open_physical(host).await?;
        let replay = self.replay_session(conn.as_mut()).await?;

        if self.is_closed() {
            let _ = conn.close().await;
            return Err(closed_engine_error());
        }

        {
            let mut slot = self.physical.lock().await;
            if let Some(mut old) = slot.replace(conn) {
                let _ = old.close().await;
            }
        }
        *self.bound.write().await = Some(host.clone());
        *self.monitor_lease.write().await = Some(self.monitors.monitor(host));

        // Losing a race with close() means tearing down what we just built
        if self.is_closed() {
            self.teardown().await;
            return Err(closed_engine_error());
        }

        if replay.applied > 0 || replay.skipped > 0 {
            debug!(
                "[{}] session replay on {}: {} applied, {} skipped",
                self.id, host.endpoint, replay.applied, replay.skipped
            );
        }
        Ok(replay)
    }

    async fn open_physical(&self, host: &HostInfo) -> Result<Box<dyn PhysicalConnection>, EngineError> {
        let timeout = self.config.failover.connect_timeout();
        match tokio::time::timeout(timeout, self.factory.connect(host)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(timeout)),
        }
    }

    /// Re-apply the recorded session to a fresh connection. A setting the
    /// server rejects is skipped with a warning; a connectivity failure
    /// fails the whole candidate.
    async fn replay_session(
        &self,
        conn: &mut dyn PhysicalConnection,
    ) -> Result<SessionReplay, EngineError> {
        let plan = self.session.read().await.replay_plan();
        let mut applied = 0;
        let mut skipped = 0;
        for setting in plan {
            match conn.apply(&setting).await {
                Ok(()) => applied += 1,
                Err(e) if e.is_connectivity_loss() => return Err(e),
                Err(e) => {
                    skipped += 1;
                    warn!(
                        "[{}] session replay skipped '{}': {}",
                        self.id, setting, e
                    );
                }
            }
        }
        Ok(SessionReplay { applied, skipped })
    }

    /// Run one operation on the bound physical connection, classifying
    /// connectivity loss so the failover stage can react.
    pub(crate) async fn execute_direct(&self, op: &Operation) -> RelevoResult<ExecuteOutcome> {
        if self.is_closed() {
            return Err(RelevoError::ConnectionClosed);
        }

        let bound = self.bound_host().await;
        if let (Some(HostRole::Writer), Some(host)) = (op.target(), &bound) {
            if host.role.is_reader() {
                return Err(RelevoError::Engine(EngineError::server(
                    "writer operation routed to a reader host",
                )));
            }
        }
        let endpoint = match bound {
            Some(host) => host.endpoint,
            None => {
                return Err(RelevoError::Engine(EngineError::protocol(
                    "connection is not bound to a host",
                )))
            }
        };

        let mut slot = self.physical.lock().await;
        let conn = match slot.as_mut() {
            Some(conn) => conn,
            None => {
                return Err(RelevoError::transient(
                    endpoint,
                    EngineError::Io(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "no live connection to the bound host",
                    )),
                ))
            }
        };

        match conn.execute(op).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_connectivity_loss() => {
                // The connection is poisoned; failover will replace it
                *slot = None;
                Err(RelevoError::transient(endpoint, e))
            }
            Err(e) => Err(RelevoError::Engine(e)),
        }
    }

    /// Apply a session setting on the live connection and record it for
    /// replay after the next rebind
    pub(crate) async fn apply_setting(&self, setting: SessionSetting) -> RelevoResult<()> {
        if self.is_closed() {
            return Err(RelevoError::ConnectionClosed);
        }
        let endpoint = match self.bound_endpoint().await {
            Some(e) => e,
            None => {
                return Err(RelevoError::Engine(EngineError::protocol(
                    "connection is not bound to a host",
                )))
            }
        };

        let mut slot = self.physical.lock().await;
        let conn = match slot.as_mut() {
            Some(conn) => conn,
            None => {
                return Err(RelevoError::transient(
                    endpoint,
                    EngineError::Io(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "no live connection to the bound host",
                    )),
                ))
            }
        };

        match conn.apply(&setting).await {
            Ok(()) => {
                drop(slot);
                self.session.write().await.record(&setting);
                debug!("[{}] session setting applied: {}", self.id, setting);
                Ok(())
            }
            Err(e) if e.is_connectivity_loss() => {
                *slot = None;
                Err(RelevoError::transient(endpoint, e))
            }
            Err(e) => Err(RelevoError::Engine(e)),
        }
    }

    /// Close the logical connection. Idempotent; always releases the
    /// monitor and refresh leases and the physical connection.
    pub(crate) async fn shutdown(&self) -> RelevoResult<()> {
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }
        self.teardown().await;
        info!("[{}] connection closed", self.id);
        Ok(())
    }

    async fn teardown(&self) {
        if let Some(mut conn) = self.physical.lock().await.take() {
            let _ = conn.close().await;
        }
        *self.bound.write().await = None;
        *self.monitor_lease.write().await = None;
        if let Ok(mut lease) = self.refresh_lease.lock() {
            *lease = None;
        }
    }
}

fn closed_engine_error() -> EngineError {
    EngineError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "logical connection closed",
    ))
}

#[async_trait]
impl PipelineTerminal for ConnectionCore {
    async fn execute(&self, _ctx: &OperationContext, op: &Operation) -> RelevoResult<ExecuteOutcome> {
        self.execute_direct(op).await
    }

    async fn connect(&self, _ctx: &OperationContext) -> RelevoResult<HostInfo> {
        self.establish_initial().await
    }

    async fn close(&self, _ctx: &OperationContext) -> RelevoResult<()> {
        self.shutdown().await
    }
}

/// Caller-facing handle for one logical connection.
///
/// Stays valid across failovers; the bound physical connection may change
/// underneath it at any time.
pub struct Connection {
    core: Arc<ConnectionCore>,
    coordinator: Arc<FailoverCoordinator>,
    pipeline: Pipeline,
    ctx: OperationContext,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.core.id())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) async fn open(
        core: Arc<ConnectionCore>,
        coordinator: Arc<FailoverCoordinator>,
        pipeline: Pipeline,
    ) -> RelevoResult<Self> {
        let ctx = OperationContext {
            connection_id: core.id().to_string(),
            cluster: core.cluster().clone(),
        };
        let conn = Self {
            core,
            coordinator,
            pipeline,
            ctx,
        };
        match conn.pipeline.connect(&conn.ctx, conn.core.as_ref()).await {
            Ok(_) => Ok(conn),
            Err(e) => {
                let _ = conn.core.shutdown().await;
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn cluster(&self) -> &ClusterId {
        self.core.cluster()
    }

    /// Current failover phase of this connection
    pub fn phase(&self) -> FailoverPhase {
        self.coordinator.phase()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Host currently serving this connection
    pub async fn bound_host(&self) -> Option<HostInfo> {
        self.core.bound_host().await
    }

    /// Run one operation through the plugin pipeline
    pub async fn execute(&self, op: Operation) -> RelevoResult<ExecuteOutcome> {
        self.pipeline.execute(&self.ctx, self.core.as_ref(), op).await
    }

    /// Close the connection, cancelling any failover in progress
    pub async fn close(&self) -> RelevoResult<()> {
        self.pipeline.close(&self.ctx, self.core.as_ref()).await
    }

    pub async fn set_autocommit(&self, on: bool) -> RelevoResult<()> {
        self.session_set(SessionSetting::Autocommit(on)).await
    }

    pub async fn set_isolation(&self, level: IsolationLevel) -> RelevoResult<()> {
        self.session_set(SessionSetting::Isolation(level)).await
    }

    pub async fn set_read_only(&self, on: bool) -> RelevoResult<()> {
        self.session_set(SessionSetting::ReadOnly(on)).await
    }

    pub async fn set_variable<N, V>(&self, name: N, value: V) -> RelevoResult<()>
    where
        N: Into<String>,
        V: Into<String>,
    {
        self.session_set(SessionSetting::Variable {
            name: name.into(),
            value: value.into(),
        })
        .await
    }

    async fn session_set(&self, setting: SessionSetting) -> RelevoResult<()> {
        // Session changes wait out (or reject on) a running failover the
        // same way operations do
        self.coordinator.gate_call().await?;
        self.core.apply_setting(setting).await
    }

    /// Voluntarily move to another host from the current topology.
    /// Best effort: returns false when the move is not possible right
    /// now, without disturbing the current binding.
    pub async fn rebind(&self, endpoint: &Endpoint) -> RelevoResult<bool> {
        let topo = match self.core.topology().cached(self.core.cluster()).await {
            Some(topo) => topo,
            None => return Ok(false),
        };
        let host = match topo.find(endpoint) {
            Some(host) => host.clone(),
            None => return Ok(false),
        };
        self.coordinator.try_rebind(&host).await
    }
}
