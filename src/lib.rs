/// Relevo - failover-aware connectivity layer for clustered databases
///
/// Relevo keeps a logical connection usable across cluster role changes:
/// it tracks topology through a versioned membership cache, watches host
/// liveness with shared probe tasks, and, when the bound host dies,
/// transparently rebinds to the new writer (or another reader) while
/// replaying recorded session state.
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod failover;
pub mod monitor;
pub mod pipeline;
pub mod topology;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::config::Config;
pub use crate::connection::Connection;
pub use crate::core::conn::{
    ConnectionFactory, ExecuteOutcome, IsolationLevel, MemberRecord, Operation,
    PhysicalConnection, SessionSetting, TopologySource,
};
pub use crate::core::{ClusterId, Endpoint, HostInfo, HostRole, Topology};
pub use crate::error::{EngineError, RelevoError, RelevoResult};
pub use crate::failover::FailoverPhase;
pub use crate::monitor::HostHealth;
pub use crate::pipeline::{ConnectionPlugin, PluginDef};

use std::sync::Arc;

use tracing::info;

use crate::config::ConfigError;
use crate::connection::ConnectionCore;
use crate::failover::FailoverCoordinator;
use crate::monitor::MonitorRegistry;
use crate::pipeline::failover::FailoverPlugin;
use crate::pipeline::routing::RoleRoutingPlugin;
use crate::pipeline::trace::CallTracePlugin;
use crate::pipeline::Pipeline;
use crate::topology::TopologyService;
use crate::utils::generate_id;

/// What to bind a new logical connection to
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub cluster: ClusterId,
    pub seeds: Vec<Endpoint>,
    pub target_role: HostRole,
    pub plugins: Vec<PluginDef>,
}

impl ConnectOptions {
    /// Options for a writer connection with the default plugin set
    pub fn new<C: Into<String>>(cluster: C, seeds: Vec<Endpoint>) -> Self {
        Self {
            cluster: ClusterId::new(cluster),
            seeds,
            target_role: HostRole::Writer,
            plugins: vec![PluginDef::CallTrace, PluginDef::RoleRouting],
        }
    }

    pub fn target_role(mut self, role: HostRole) -> Self {
        self.target_role = role;
        self
    }

    pub fn plugins(mut self, plugins: Vec<PluginDef>) -> Self {
        self.plugins = plugins;
        self
    }
}

/// Shared driver state: one per process, hands out logical connections.
///
/// Connections made through one driver share its topology cache and its
/// host probe tasks, so ten connections to the same cluster cost one
/// membership refresh loop and one probe task per distinct host.
pub struct Driver {
    config: Arc<Config>,
    factory: Arc<dyn ConnectionFactory>,
    topology: Arc<TopologyService>,
    monitors: Arc<MonitorRegistry>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").finish_non_exhaustive()
    }
}

impl Driver {
    pub fn builder() -> DriverBuilder {
        DriverBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyService> {
        &self.topology
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    /// Open a logical connection.
    ///
    /// The plugin list is resolved here, once; the resulting pipeline is
    /// fixed for the connection's lifetime. The failover stage is always
    /// appended closest to the terminal.
    pub async fn connect(&self, options: ConnectOptions) -> RelevoResult<Connection> {
        let id = generate_id("conn");
        let core = ConnectionCore::new(
            id.clone(),
            options.cluster.clone(),
            options.seeds.clone(),
            options.target_role,
            self.config.clone(),
            self.topology.clone(),
            self.monitors.clone(),
            self.factory.clone(),
        );
        let coordinator = FailoverCoordinator::new(core.clone());

        let mut plugins: Vec<Arc<dyn ConnectionPlugin>> =
            Vec::with_capacity(options.plugins.len() + 1);
        for def in &options.plugins {
            plugins.push(match def {
                PluginDef::CallTrace => Arc::new(CallTracePlugin::new()),
                PluginDef::RoleRouting => {
                    Arc::new(RoleRoutingPlugin::new(options.target_role, coordinator.clone()))
                }
                PluginDef::Custom(plugin) => plugin.clone(),
            });
        }
        plugins.push(Arc::new(FailoverPlugin::new(coordinator.clone())));
        let pipeline = Pipeline::new(plugins);

        info!(
            "[{}] opening {} connection to cluster '{}' (plugins: {:?})",
            id,
            options.target_role,
            options.cluster,
            pipeline.names()
        );
        Connection::open(core, coordinator, pipeline).await
    }

    /// Stop the shared refresh and probe tasks. Connections still open
    /// keep serving on their current binding but lose monitoring and
    /// topology upkeep; closing them afterwards is still clean.
    pub async fn shutdown(&self) {
        self.topology.shutdown_all().await;
        self.monitors.shutdown_all();
        info!("driver shut down");
    }
}

/// Builder for [`Driver`]
pub struct DriverBuilder {
    config: Config,
    factory: Option<Arc<dyn ConnectionFactory>>,
    source: Option<Arc<dyn TopologySource>>,
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            factory: None,
            source: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Engine-specific connection factory (required)
    pub fn factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Engine-specific membership query (required)
    pub fn topology_source(mut self, source: Arc<dyn TopologySource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> RelevoResult<Driver> {
        self.config.validate()?;
        let factory = self.factory.ok_or_else(|| {
            RelevoError::Config(ConfigError::ValidationError(
                "a connection factory is required".to_string(),
            ))
        })?;
        let source = self.source.ok_or_else(|| {
            RelevoError::Config(ConfigError::ValidationError(
                "a topology source is required".to_string(),
            ))
        })?;

        let config = Arc::new(self.config);
        let topology =
            TopologyService::new(config.topology.clone(), factory.clone(), source);
        let monitors = MonitorRegistry::new(config.monitor.clone(), factory.clone());
        Ok(Driver {
            config,
            factory,
            topology,
            monitors,
        })
    }
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ep, reader, writer, ClusterSim, MockFactory, MockSource};
    use std::time::Duration;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.topology.refresh_interval_ms = 5_000;
        config.topology.staleness_threshold_ms = 10_000;
        config.topology.refresh_backoff_ms = 5;
        config.monitor.probe_interval_ms = 20;
        config.monitor.probe_timeout_ms = 10;
        config.monitor.failure_threshold = 2;
        config.failover.writer_failover_timeout_ms = 2_000;
        config.failover.writer_poll_interval_ms = 20;
        config.failover.connect_timeout_ms = 200;
        config.failover.reconnect_max_attempts = 3;
        config.failover.reconnect_backoff_base_ms = 5;
        config.failover.reconnect_backoff_cap_ms = 20;
        config
    }

    fn driver_for(sim: &Arc<ClusterSim>, config: Config) -> Driver {
        Driver::builder()
            .config(config)
            .factory(MockFactory::new(sim.clone()))
            .topology_source(MockSource::new(sim.clone()))
            .build()
            .unwrap()
    }

    fn options() -> ConnectOptions {
        ConnectOptions::new("main", vec![ep("a")])
    }

    #[test]
    fn test_builder_requires_factory_and_source() {
        let err = Driver::builder().build().unwrap_err();
        assert!(matches!(err, RelevoError::Config(_)));

        let sim = ClusterSim::with_members(vec![writer("a")]);
        let err = Driver::builder()
            .factory(MockFactory::new(sim.clone()))
            .build()
            .unwrap_err();
        assert!(matches!(err, RelevoError::Config(_)));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let sim = ClusterSim::with_members(vec![writer("a")]);
        let mut config = fast_config();
        // probe timeout must stay below the probe interval
        config.monitor.probe_timeout_ms = config.monitor.probe_interval_ms;
        let err = Driver::builder()
            .config(config)
            .factory(MockFactory::new(sim.clone()))
            .topology_source(MockSource::new(sim.clone()))
            .build()
            .unwrap_err();
        assert!(matches!(err, RelevoError::Config(_)));
    }

    #[tokio::test]
    async fn test_writer_failover_end_to_end() {
        let sim = ClusterSim::with_members(vec![writer("a"), reader("b")]);
        let driver = driver_for(&sim, fast_config());
        let conn = driver.connect(options()).await.unwrap();
        assert_eq!(conn.bound_host().await.unwrap().endpoint, ep("a"));

        conn.execute(Operation::write("insert 1")).await.unwrap();

        sim.kill(&ep("a"));
        sim.promote(&ep("b"));

        // the broken call surfaces after the failover completed
        let err = conn.execute(Operation::write("insert 2")).await.unwrap_err();
        assert!(matches!(err, RelevoError::TransientConnectivity { .. }));
        assert!(err.is_retryable());
        assert_eq!(conn.phase(), FailoverPhase::Connected);
        assert_eq!(conn.bound_host().await.unwrap().endpoint, ep("b"));

        // retrying lands on the new writer
        conn.execute(Operation::write("insert 2")).await.unwrap();
        assert!(sim
            .executed()
            .iter()
            .any(|(e, payload)| e == &ep("b") && payload == "insert 2"));
    }

    #[tokio::test]
    async fn test_reader_reroutes_end_to_end() {
        let sim = ClusterSim::with_members(vec![writer("a"), reader("b"), reader("c")]);
        let driver = driver_for(&sim, fast_config());
        let conn = driver
            .connect(options().target_role(HostRole::Reader))
            .await
            .unwrap();
        assert_eq!(conn.bound_host().await.unwrap().endpoint, ep("b"));

        sim.kill(&ep("b"));
        let err = conn.execute(Operation::read("select 1")).await.unwrap_err();
        assert!(matches!(err, RelevoError::TransientConnectivity { .. }));

        assert_eq!(conn.bound_host().await.unwrap().endpoint, ep("c"));
        conn.execute(Operation::read("select 1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_end_to_end() {
        let sim = ClusterSim::with_members(vec![writer("a")]);
        let mut config = fast_config();
        config.failover.writer_failover_timeout_ms = 100;
        let driver = driver_for(&sim, config);
        let conn = driver.connect(options()).await.unwrap();

        sim.kill(&ep("a"));
        let err = conn.execute(Operation::write("insert 1")).await.unwrap_err();
        assert!(matches!(err, RelevoError::FailoverTimeout { .. }));
        assert_eq!(conn.phase(), FailoverPhase::FailedPermanently);

        // every later call fails fast
        let err = conn.execute(Operation::write("insert 2")).await.unwrap_err();
        assert!(matches!(err, RelevoError::FailedPermanently));

        // close still works and releases everything
        conn.close().await.unwrap();
        assert_eq!(driver.monitors().active_count(), 0);
    }

    #[tokio::test]
    async fn test_session_settings_survive_failover() {
        let sim = ClusterSim::with_members(vec![writer("a"), reader("b")]);
        let driver = driver_for(&sim, fast_config());
        let conn = driver.connect(options()).await.unwrap();
        conn.set_autocommit(false).await.unwrap();
        conn.set_variable("app_name", "relevo").await.unwrap();

        sim.kill(&ep("a"));
        sim.promote(&ep("b"));
        let _ = conn.execute(Operation::write("insert 1")).await;

        assert_eq!(conn.bound_host().await.unwrap().endpoint, ep("b"));
        let replayed: Vec<String> = sim
            .applied()
            .iter()
            .filter(|(e, _)| e == &ep("b"))
            .map(|(_, s)| s.clone())
            .collect();
        assert_eq!(replayed, vec!["autocommit=false", "app_name=relevo"]);
    }

    #[tokio::test]
    async fn test_queued_calls_wait_for_recovery() {
        let sim = ClusterSim::with_members(vec![writer("a"), reader("b")]);
        let mut config = fast_config();
        config.failover.reject_calls_during_failover = false;
        let driver = driver_for(&sim, config);
        let conn = Arc::new(driver.connect(options()).await.unwrap());

        sim.kill(&ep("a"));
        sim.promote(&ep("b"));
        sim.set_fetch_delay(Duration::from_millis(60));

        let breaking = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.execute(Operation::write("insert 1")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // issued mid-failover, held until recovery, then served by the
        // new writer
        conn.execute(Operation::write("insert 2")).await.unwrap();
        assert!(sim
            .executed()
            .iter()
            .any(|(e, payload)| e == &ep("b") && payload == "insert 2"));

        let err = breaking.await.unwrap().unwrap_err();
        assert!(matches!(err, RelevoError::TransientConnectivity { .. }));
    }

    #[tokio::test]
    async fn test_connections_share_probe_tasks() {
        let sim = ClusterSim::with_members(vec![writer("a"), reader("b")]);
        let driver = driver_for(&sim, fast_config());

        let first = driver.connect(options()).await.unwrap();
        let second = driver.connect(options()).await.unwrap();
        assert_ne!(first.id(), second.id());
        // both writers bind host a; one probe task serves them both
        assert_eq!(driver.monitors().active_count(), 1);

        first.close().await.unwrap();
        assert_eq!(driver.monitors().active_count(), 1);

        second.close().await.unwrap();
        assert_eq!(driver.monitors().active_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_writer_target_rejected_on_reader() {
        let sim = ClusterSim::with_members(vec![writer("a"), reader("b")]);
        let driver = driver_for(&sim, fast_config());
        let conn = driver
            .connect(options().target_role(HostRole::Reader))
            .await
            .unwrap();

        let mut op = Operation::write("update t");
        op.set_target(HostRole::Writer);
        let err = conn.execute(op).await.unwrap_err();
        assert!(matches!(err, RelevoError::Engine(_)));
        assert!(!err.is_retryable());
        // the binding itself is untouched
        assert_eq!(conn.phase(), FailoverPhase::Connected);
    }

    #[tokio::test]
    async fn test_connect_fails_when_cluster_unreachable() {
        let sim = ClusterSim::with_members(vec![writer("a")]);
        sim.kill(&ep("a"));
        let driver = driver_for(&sim, fast_config());

        let err = driver.connect(options()).await.unwrap_err();
        assert!(matches!(
            err,
            RelevoError::TopologyQuery { .. } | RelevoError::NoAvailableHost { .. }
        ));
        // nothing may leak from the failed attempt
        assert_eq!(driver.monitors().active_count(), 0);
    }

    #[tokio::test]
    async fn test_driver_shutdown_stops_shared_tasks() {
        let sim = ClusterSim::with_members(vec![writer("a")]);
        let driver = driver_for(&sim, fast_config());
        let conn = driver.connect(options()).await.unwrap();
        assert_eq!(driver.monitors().active_count(), 1);

        driver.shutdown().await;
        assert_eq!(driver.monitors().active_count(), 0);

        // the surviving connection keeps its binding and closes cleanly
        conn.execute(Operation::write("insert 1")).await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_voluntary_rebind() {
        let sim = ClusterSim::with_members(vec![writer("a"), reader("b")]);
        let driver = driver_for(&sim, fast_config());
        let conn = driver
            .connect(options().target_role(HostRole::Reader))
            .await
            .unwrap();
        assert_eq!(conn.bound_host().await.unwrap().endpoint, ep("b"));

        assert!(conn.rebind(&ep("a")).await.unwrap());
        assert_eq!(conn.bound_host().await.unwrap().endpoint, ep("a"));

        // unknown endpoints are declined, not an error
        assert!(!conn.rebind(&ep("nowhere")).await.unwrap());
    }
}
