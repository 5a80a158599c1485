/// Failover stage of the pipeline.
///
/// Sits directly above the terminal: it gates calls on the failover
/// phase, races every operation against the bound host's monitor so a
/// stalled call does not outlive a dead host, and hands connectivity
/// losses to the coordinator. Call traffic also nudges a background
/// topology refresh once the cached snapshot goes stale.
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::core::conn::{ExecuteOutcome, Operation};
use crate::error::{EngineError, RelevoError, RelevoResult};
use crate::failover::FailoverCoordinator;
use crate::monitor::HostHealth;
use crate::pipeline::{ConnectionPlugin, ExecuteNext};

pub struct FailoverPlugin {
    coordinator: Arc<FailoverCoordinator>,
}

impl FailoverPlugin {
    pub(crate) fn new(coordinator: Arc<FailoverCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ConnectionPlugin for FailoverPlugin {
    fn name(&self) -> &str {
        "failover"
    }

    async fn execute(&self, op: Operation, next: ExecuteNext<'_>) -> RelevoResult<ExecuteOutcome> {
        self.coordinator.gate_call().await?;

        // a stale cache refreshes in the background behind call traffic
        let core = self.coordinator.core();
        core.topology().ensure_fresh(core.cluster()).await;

        let retry_op = op.clone();
        let result = match self.coordinator.core().dead_watch().await {
            Some((endpoint, rx)) => {
                tokio::select! {
                    result = next.run(op) => result,
                    _ = wait_until_dead(rx) => Err(RelevoError::transient(
                        endpoint,
                        EngineError::Io(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "host monitor declared the host dead",
                        )),
                    )),
                }
            }
            None => next.run(op).await,
        };

        match result {
            Err(RelevoError::TransientConnectivity { endpoint, source }) => {
                match self
                    .coordinator
                    .handle_failure(endpoint.clone(), &retry_op)
                    .await?
                {
                    Some(outcome) => Ok(outcome),
                    // recovered, but the interrupted operation still failed
                    None => Err(RelevoError::TransientConnectivity { endpoint, source }),
                }
            }
            other => other,
        }
    }
}

async fn wait_until_dead(mut rx: watch::Receiver<HostHealth>) {
    loop {
        if *rx.borrow_and_update() == HostHealth::Dead {
            return;
        }
        if rx.changed().await.is_err() {
            // monitor released mid-call; nothing left to report
            std::future::pending::<()>().await;
        }
    }
}
