/// Shared test doubles: an in-memory cluster with scriptable failures
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::conn::{
    ConnectionFactory, ExecuteOutcome, MemberRecord, Operation, PhysicalConnection,
    SessionSetting, TopologySource,
};
use crate::core::{Endpoint, HostInfo, HostRole};
use crate::error::EngineError;

/// How a scripted `apply` failure presents itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyFailure {
    /// The server rejects the setting but the connection stays usable
    Benign,
    /// The connection drops while the setting is applied
    Disconnect,
}

/// Scriptable in-memory cluster shared by a connection factory and a
/// topology source. Tests flip hosts up and down, reshape membership,
/// and inspect what the code under test did to each host.
#[derive(Default)]
pub struct ClusterSim {
    members: Mutex<Vec<MemberRecord>>,
    down: Mutex<HashSet<Endpoint>>,
    topology_fails: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
    fetch_inflight: AtomicUsize,
    fetch_max_inflight: AtomicUsize,
    fetch_count: AtomicUsize,
    connect_log: Mutex<Vec<Endpoint>>,
    apply_log: Mutex<Vec<(Endpoint, String)>>,
    execute_log: Mutex<Vec<(Endpoint, String)>>,
    execute_drops: Mutex<HashSet<Endpoint>>,
    apply_failures: Mutex<HashMap<Endpoint, ApplyFailure>>,
    ping_delays: Mutex<HashMap<Endpoint, Duration>>,
    connect_delays: Mutex<HashMap<Endpoint, Duration>>,
    execute_delays: Mutex<HashMap<Endpoint, Duration>>,
}

impl ClusterSim {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_members(members: Vec<MemberRecord>) -> Arc<Self> {
        let sim = Self::new();
        sim.set_members(members);
        sim
    }

    pub fn set_members(&self, members: Vec<MemberRecord>) {
        *self.members.lock().unwrap() = members;
    }

    pub fn members(&self) -> Vec<MemberRecord> {
        self.members.lock().unwrap().clone()
    }

    pub fn add_member(&self, member: MemberRecord) {
        self.members.lock().unwrap().push(member);
    }

    pub fn remove_host(&self, endpoint: &Endpoint) {
        self.members
            .lock()
            .unwrap()
            .retain(|m| &m.endpoint != endpoint);
    }

    pub fn set_role(&self, endpoint: &Endpoint, role: HostRole) {
        for member in self.members.lock().unwrap().iter_mut() {
            if &member.endpoint == endpoint {
                member.role = role;
            }
        }
    }

    /// Make `endpoint` the writer and demote any other writer to reader
    pub fn promote(&self, endpoint: &Endpoint) {
        for member in self.members.lock().unwrap().iter_mut() {
            if &member.endpoint == endpoint {
                member.role = HostRole::Writer;
            } else if member.role == HostRole::Writer {
                member.role = HostRole::Reader;
            }
        }
    }

    /// Take the host down: connects are refused, live connections break
    pub fn kill(&self, endpoint: &Endpoint) {
        self.down.lock().unwrap().insert(endpoint.clone());
    }

    pub fn revive(&self, endpoint: &Endpoint) {
        self.down.lock().unwrap().remove(endpoint);
    }

    pub fn is_down(&self, endpoint: &Endpoint) -> bool {
        self.down.lock().unwrap().contains(endpoint)
    }

    pub fn fail_topology(&self, fails: bool) {
        self.topology_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    /// Break the next execute on this endpoint without taking the host down
    pub fn drop_next_execute(&self, endpoint: &Endpoint) {
        self.execute_drops.lock().unwrap().insert(endpoint.clone());
    }

    pub fn fail_apply(&self, endpoint: &Endpoint, failure: ApplyFailure) {
        self.apply_failures
            .lock()
            .unwrap()
            .insert(endpoint.clone(), failure);
    }

    /// Make pings to this endpoint hang for `delay` before answering
    pub fn set_ping_delay(&self, endpoint: &Endpoint, delay: Duration) {
        self.ping_delays
            .lock()
            .unwrap()
            .insert(endpoint.clone(), delay);
    }

    /// Make new connections to this endpoint take `delay` to come up
    pub fn set_connect_delay(&self, endpoint: &Endpoint, delay: Duration) {
        self.connect_delays
            .lock()
            .unwrap()
            .insert(endpoint.clone(), delay);
    }

    /// Make every execute on this endpoint stall for `delay` first
    pub fn set_execute_delay(&self, endpoint: &Endpoint, delay: Duration) {
        self.execute_delays
            .lock()
            .unwrap()
            .insert(endpoint.clone(), delay);
    }

    pub fn connects(&self) -> Vec<Endpoint> {
        self.connect_log.lock().unwrap().clone()
    }

    pub fn connect_count(&self, endpoint: &Endpoint) -> usize {
        self.connect_log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == endpoint)
            .count()
    }

    pub fn applied(&self) -> Vec<(Endpoint, String)> {
        self.apply_log.lock().unwrap().clone()
    }

    pub fn executed(&self) -> Vec<(Endpoint, String)> {
        self.execute_log.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn max_inflight_fetches(&self) -> usize {
        self.fetch_max_inflight.load(Ordering::SeqCst)
    }

    fn take_execute_drop(&self, endpoint: &Endpoint) -> bool {
        self.execute_drops.lock().unwrap().remove(endpoint)
    }

    fn apply_failure(&self, endpoint: &Endpoint) -> Option<ApplyFailure> {
        self.apply_failures.lock().unwrap().get(endpoint).copied()
    }
}

pub fn ep(host: &str) -> Endpoint {
    Endpoint::new(host, 5432)
}

pub fn writer(host: &str) -> MemberRecord {
    MemberRecord::new(ep(host), HostRole::Writer)
}

pub fn reader(host: &str) -> MemberRecord {
    MemberRecord::new(ep(host), HostRole::Reader)
}

fn disconnect_error() -> EngineError {
    EngineError::Io(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
}

/// One simulated physical connection to a host in the cluster
pub struct SimConn {
    sim: Arc<ClusterSim>,
    endpoint: Endpoint,
    closed: bool,
}

#[async_trait]
impl PhysicalConnection for SimConn {
    async fn execute(&mut self, op: &Operation) -> Result<ExecuteOutcome, EngineError> {
        if self.closed {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )));
        }
        let delay = self.sim.execute_delays.lock().unwrap().get(&self.endpoint).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.sim.take_execute_drop(&self.endpoint) || self.sim.is_down(&self.endpoint) {
            return Err(disconnect_error());
        }
        self.sim.execute_log.lock().unwrap().push((
            self.endpoint.clone(),
            String::from_utf8_lossy(op.payload()).to_string(),
        ));
        Ok(ExecuteOutcome::new(1, op.payload().clone()))
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        let delay = self.sim.ping_delays.lock().unwrap().get(&self.endpoint).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.closed || self.sim.is_down(&self.endpoint) {
            return Err(disconnect_error());
        }
        Ok(())
    }

    async fn apply(&mut self, setting: &SessionSetting) -> Result<(), EngineError> {
        if self.closed || self.sim.is_down(&self.endpoint) {
            return Err(disconnect_error());
        }
        match self.sim.apply_failure(&self.endpoint) {
            Some(ApplyFailure::Benign) => {
                Err(EngineError::server("unrecognized configuration parameter"))
            }
            Some(ApplyFailure::Disconnect) => Err(disconnect_error()),
            None => {
                self.sim
                    .apply_log
                    .lock()
                    .unwrap()
                    .push((self.endpoint.clone(), setting.to_string()));
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.closed = true;
        Ok(())
    }
}

/// Factory handing out `SimConn`s, refusing hosts that are down
pub struct MockFactory {
    sim: Arc<ClusterSim>,
}

impl MockFactory {
    pub fn new(sim: Arc<ClusterSim>) -> Arc<Self> {
        Arc::new(Self { sim })
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, host: &HostInfo) -> Result<Box<dyn PhysicalConnection>, EngineError> {
        self.sim
            .connect_log
            .lock()
            .unwrap()
            .push(host.endpoint.clone());
        let delay = self.sim.connect_delays.lock().unwrap().get(&host.endpoint).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.sim.is_down(&host.endpoint) {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(Box::new(SimConn {
            sim: Arc::clone(&self.sim),
            endpoint: host.endpoint.clone(),
            closed: false,
        }))
    }
}

/// Topology source answering from the simulator's member list
pub struct MockSource {
    sim: Arc<ClusterSim>,
}

impl MockSource {
    pub fn new(sim: Arc<ClusterSim>) -> Arc<Self> {
        Arc::new(Self { sim })
    }
}

#[async_trait]
impl TopologySource for MockSource {
    async fn fetch_members(
        &self,
        _conn: &mut dyn PhysicalConnection,
    ) -> Result<Vec<MemberRecord>, EngineError> {
        let inflight = self.sim.fetch_inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.sim
            .fetch_max_inflight
            .fetch_max(inflight, Ordering::SeqCst);
        self.sim.fetch_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.sim.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.sim.topology_fails.load(Ordering::SeqCst) {
            Err(EngineError::server("membership query failed"))
        } else {
            Ok(self.sim.members())
        };

        self.sim.fetch_inflight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
