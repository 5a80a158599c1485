/// Role routing plugin
///
/// Stamps every operation with the connection's target role so the
/// terminal can check the bound host against it. An explicit target set
/// by the caller wins over the connection default. A reader connection
/// parked on the writer also steers itself back onto a reader once the
/// topology lists a healthy one.
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::{ConnectionPlugin, ExecuteNext};
use crate::core::conn::{ExecuteOutcome, Operation};
use crate::core::{HostInfo, HostRole};
use crate::error::RelevoResult;
use crate::failover::FailoverCoordinator;
use crate::monitor::HostHealth;

pub struct RoleRoutingPlugin {
    role: HostRole,
    coordinator: Arc<FailoverCoordinator>,
    // topology version of the last reroute attempt; one try per view
    rerouted_at: Mutex<u64>,
}

impl RoleRoutingPlugin {
    pub(crate) fn new(role: HostRole, coordinator: Arc<FailoverCoordinator>) -> Self {
        Self {
            role,
            coordinator,
            rerouted_at: Mutex::new(0),
        }
    }

    /// Best reader in the cached topology, heaviest first. Voluntary
    /// moves never target hosts the monitor has flagged.
    async fn reader_candidate(&self) -> Option<(u64, HostInfo)> {
        let core = self.coordinator.core();
        let topo = core.topology().cached(core.cluster()).await?;
        let mut readers: Vec<&HostInfo> = topo
            .readers()
            .filter(|h| h.is_up())
            .filter(|h| {
                matches!(
                    core.monitors().health_of(&h.endpoint),
                    None | Some(HostHealth::Alive)
                )
            })
            .collect();
        readers.sort_by(|a, b| {
            b.weight
                .cmp(&a.weight)
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });
        readers.first().map(|h| (topo.version(), (*h).clone()))
    }

    async fn reroute_to_reader(&self) -> RelevoResult<()> {
        let core = self.coordinator.core();
        let bound = match core.bound_host().await {
            Some(host) if host.role.is_writer() => host,
            _ => return Ok(()),
        };
        let (version, candidate) = match self.reader_candidate().await {
            Some(found) => found,
            None => return Ok(()),
        };

        if let Ok(mut last) = self.rerouted_at.lock() {
            if *last == version {
                return Ok(());
            }
            *last = version;
        }

        if self.coordinator.try_rebind(&candidate).await? {
            debug!(
                "[{}] reader connection moved off writer {} to {}",
                core.id(),
                bound.endpoint,
                candidate.endpoint
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionPlugin for RoleRoutingPlugin {
    fn name(&self) -> &str {
        "role-routing"
    }

    async fn execute(&self, mut op: Operation, next: ExecuteNext<'_>) -> RelevoResult<ExecuteOutcome> {
        if op.target().is_none() {
            op.set_target(self.role);
        }
        if self.role == HostRole::Reader && op.target() == Some(HostRole::Reader) {
            self.reroute_to_reader().await?;
        }
        next.run(op).await
    }
}
